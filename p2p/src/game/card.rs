use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of cards in a full deck.
pub const DECK_SIZE: usize = 108;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colour {
    Red,
    Yellow,
    Green,
    Blue,
    Wild,
}

impl Colour {
    /// The colours a wild card can name, in tie-break order.
    pub const NAMEABLE: [Colour; 4] = [Colour::Red, Colour::Yellow, Colour::Green, Colour::Blue];

    pub fn is_wild(self) -> bool {
        self == Colour::Wild
    }
}

impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Colour::Red => "red",
            Colour::Yellow => "yellow",
            Colour::Green => "green",
            Colour::Blue => "blue",
            Colour::Wild => "wild",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Colour {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" | "r" => Ok(Colour::Red),
            "yellow" | "y" => Ok(Colour::Yellow),
            "green" | "g" => Ok(Colour::Green),
            "blue" | "b" => Ok(Colour::Blue),
            other => Err(format!("unknown colour {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Number(u8),
    Skip,
    Reverse,
    DrawTwo,
    Wild,
    WildDrawFour,
}

impl Value {
    pub fn is_number(self) -> bool {
        matches!(self, Value::Number(_))
    }

    /// Cards the next seat has to take when this is played.
    pub fn penalty(self) -> usize {
        match self {
            Value::DrawTwo => 2,
            Value::WildDrawFour => 4,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Card {
    pub colour: Colour,
    pub value: Value,
}

impl Card {
    pub const fn new(colour: Colour, value: Value) -> Self {
        Self { colour, value }
    }

    pub fn is_wild(&self) -> bool {
        self.colour.is_wild()
    }

    /// Whether this card may go on `top` while `active` is the colour in play.
    pub fn playable_on(&self, top: &Card, active: Colour) -> bool {
        self.is_wild() || self.colour == active || self.value == top.value
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Number(n) => write!(f, "{} {n}", self.colour),
            Value::Skip => write!(f, "{} skip", self.colour),
            Value::Reverse => write!(f, "{} reverse", self.colour),
            Value::DrawTwo => write!(f, "{} +2", self.colour),
            Value::Wild => f.write_str("wild"),
            Value::WildDrawFour => f.write_str("wild +4"),
        }
    }
}

/// The full unshuffled deck: per colour one 0, two of each 1–9 and two each
/// of skip, reverse and +2; then four wilds and four wild +4s.
pub fn full_deck() -> Vec<Card> {
    let mut deck = Vec::with_capacity(DECK_SIZE);
    for colour in Colour::NAMEABLE {
        deck.push(Card::new(colour, Value::Number(0)));
        for n in 1..=9 {
            deck.push(Card::new(colour, Value::Number(n)));
            deck.push(Card::new(colour, Value::Number(n)));
        }
    }
    for colour in Colour::NAMEABLE {
        for _ in 0..2 {
            deck.push(Card::new(colour, Value::Skip));
            deck.push(Card::new(colour, Value::Reverse));
            deck.push(Card::new(colour, Value::DrawTwo));
        }
    }
    for _ in 0..4 {
        deck.push(Card::new(Colour::Wild, Value::Wild));
        deck.push(Card::new(Colour::Wild, Value::WildDrawFour));
    }
    deck
}

pub fn shuffled_deck<R: Rng + ?Sized>(rng: &mut R) -> Vec<Card> {
    let mut deck = full_deck();
    deck.shuffle(rng);
    deck
}
