use serde::{Deserialize, Serialize};

use super::card::{Card, Colour};
use super::state::Action;

/// What a seat wants to do on its turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Decision {
    Play {
        card_index: usize,
        colour: Option<Colour>,
    },
    Draw,
}

impl Decision {
    /// Turn the decision into an action for turn `turn`.
    pub fn into_action(self, turn: u64) -> Action {
        match self {
            Decision::Play { card_index, colour } => Action::Play {
                turn,
                card_index,
                colour,
            },
            Decision::Draw => Action::Draw { turn },
        }
    }
}

/// Pick a move for `hand` against the card on top of the discard pile.
///
/// Action cards are played before number cards; otherwise the first playable
/// card goes. Wild cards name the colour the hand holds most of.
pub fn decide(hand: &[Card], top: &Card, active: Colour) -> Decision {
    let mut first_playable = None;
    for (index, card) in hand.iter().enumerate() {
        if !card.playable_on(top, active) {
            continue;
        }
        if !card.value.is_number() {
            return play(hand, index);
        }
        first_playable.get_or_insert(index);
    }
    match first_playable {
        Some(index) => play(hand, index),
        None => Decision::Draw,
    }
}

fn play(hand: &[Card], card_index: usize) -> Decision {
    let colour = hand[card_index]
        .is_wild()
        .then(|| preferred_colour(hand));
    Decision::Play { card_index, colour }
}

/// The non-wild colour that appears most often in `hand`.
///
/// Ties go to the earlier colour in red, yellow, green, blue order, which also
/// makes red the answer for a hand of only wild cards.
pub fn preferred_colour(hand: &[Card]) -> Colour {
    let mut best = Colour::Red;
    let mut best_count = 0;
    for colour in Colour::NAMEABLE {
        let count = hand.iter().filter(|c| c.colour == colour).count();
        if count > best_count {
            best = colour;
            best_count = count;
        }
    }
    best
}
