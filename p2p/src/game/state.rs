use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ai;
use super::card::{self, Card, Colour};

/// Seats at the table; the ones no person takes are played by bots.
pub const SEATS: usize = 4;
pub const HAND_SIZE: usize = 7;

/// A bot-only table would otherwise run forever without a human turn to stop at.
const MAX_BOT_MOVES: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("action was made for turn {found}, the game is at turn {expected}")]
    StaleTurn { expected: u64, found: u64 },
    #[error("seat {seat} acted out of turn, seat {current} is playing")]
    NotYourTurn { seat: usize, current: usize },
    #[error("the game is over")]
    GameOver,
    #[error("no seat {0}")]
    UnknownSeat(usize),
    #[error("no card at position {0}")]
    InvalidCard(usize),
    #[error("{0} cannot be played now")]
    Unplayable(Card),
    #[error("a wild card cannot name wild as its colour")]
    InvalidColour,
}

/// Who sits where when a game is dealt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seat {
    pub id: String,
    pub name: String,
}

impl Seat {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: String,
    pub bot: bool,
    pub hand: Vec<Card>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Clockwise,
    Counterclockwise,
}

impl Direction {
    fn reversed(self) -> Self {
        match self {
            Direction::Clockwise => Direction::Counterclockwise,
            Direction::Counterclockwise => Direction::Clockwise,
        }
    }
}

/// Something a seat can do on its turn.
///
/// Every action names the turn it was chosen for so the host can refuse one
/// that arrives after the game has moved on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Action {
    Play {
        turn: u64,
        card_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        colour: Option<Colour>,
    },
    Draw {
        turn: u64,
    },
}

impl Action {
    pub fn turn(&self) -> u64 {
        match self {
            Action::Play { turn, .. } | Action::Draw { turn } => *turn,
        }
    }
}

/// The complete state of one game. This is what snapshots carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    pub players: Vec<Player>,
    /// Top of the pile is the last element.
    pub draw_pile: Vec<Card>,
    /// Top of the pile is the last element.
    pub discard_pile: Vec<Card>,
    pub active_colour: Colour,
    pub current: usize,
    pub direction: Direction,
    /// Incremented by every accepted action.
    pub turn: u64,
    pub winner: Option<usize>,
}

impl GameState {
    /// Shuffle a deck with `seed` and deal a hand to every seat.
    ///
    /// `people` take the first seats in order; the rest become bots.
    pub fn deal(people: &[Seat], seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut deck = card::shuffled_deck(&mut rng);

        let mut players = Vec::with_capacity(SEATS);
        for index in 0..SEATS {
            let hand = deck.split_off(deck.len() - HAND_SIZE);
            let player = match people.get(index) {
                Some(seat) => Player {
                    id: seat.id.clone(),
                    name: seat.name.clone(),
                    bot: false,
                    hand,
                },
                None => Player {
                    id: format!("bot-{index}"),
                    name: format!("Bot {index}"),
                    bot: true,
                    hand,
                },
            };
            players.push(player);
        }

        let start = deck
            .iter()
            .rposition(|c| c.value.is_number())
            .unwrap_or(deck.len() - 1);
        let first = deck.remove(start);

        tracing::debug!(seed, humans = people.len().min(SEATS), first = %first, "game dealt");
        Self {
            players,
            draw_pile: deck,
            discard_pile: vec![first],
            active_colour: first.colour,
            current: 0,
            direction: Direction::Clockwise,
            turn: 0,
            winner: None,
        }
    }

    pub fn top_card(&self) -> Option<&Card> {
        self.discard_pile.last()
    }

    pub fn current_player(&self) -> &Player {
        &self.players[self.current]
    }

    pub fn is_over(&self) -> bool {
        self.winner.is_some()
    }

    pub fn seat_of(&self, id: &str) -> Option<usize> {
        self.players.iter().position(|p| p.id == id)
    }

    /// Whether `seat` could play the card at `index` right now.
    pub fn can_play(&self, seat: usize, index: usize) -> bool {
        if self.is_over() || seat != self.current {
            return false;
        }
        match (self.players.get(seat).and_then(|p| p.hand.get(index)), self.top_card()) {
            (Some(card), Some(top)) => card.playable_on(top, self.active_colour),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Apply `action` for `seat`, returning the next state.
    pub fn apply(&self, seat: usize, action: &Action) -> Result<GameState, Rejected> {
        let mut next = self.clone();
        next.apply_in_place(seat, action)?;
        Ok(next)
    }

    fn apply_in_place(&mut self, seat: usize, action: &Action) -> Result<(), Rejected> {
        if self.is_over() {
            return Err(Rejected::GameOver);
        }
        if seat >= self.players.len() {
            return Err(Rejected::UnknownSeat(seat));
        }
        if action.turn() != self.turn {
            return Err(Rejected::StaleTurn {
                expected: self.turn,
                found: action.turn(),
            });
        }
        if seat != self.current {
            return Err(Rejected::NotYourTurn {
                seat,
                current: self.current,
            });
        }

        match *action {
            Action::Play {
                card_index, colour, ..
            } => self.play(seat, card_index, colour),
            Action::Draw { .. } => {
                if let Some(card) = self.draw_one() {
                    self.players[seat].hand.push(card);
                }
                self.current = self.next_seat(seat);
                self.turn += 1;
                Ok(())
            }
        }
    }

    fn play(&mut self, seat: usize, index: usize, colour: Option<Colour>) -> Result<(), Rejected> {
        let card = *self.players[seat]
            .hand
            .get(index)
            .ok_or(Rejected::InvalidCard(index))?;
        if !self.can_play(seat, index) {
            return Err(Rejected::Unplayable(card));
        }
        if colour == Some(Colour::Wild) {
            return Err(Rejected::InvalidColour);
        }

        let hand = &mut self.players[seat].hand;
        hand.remove(index);
        self.active_colour = if card.is_wild() {
            colour.unwrap_or_else(|| ai::preferred_colour(hand))
        } else {
            card.colour
        };
        self.discard_pile.push(card);
        self.turn += 1;

        if self.players[seat].hand.is_empty() {
            tracing::info!(seat, name = %self.players[seat].name, "game won");
            self.winner = Some(seat);
            return Ok(());
        }

        if card.value == card::Value::Reverse {
            self.direction = self.direction.reversed();
        }
        let mut next = self.next_seat(seat);
        let penalty = card.value.penalty();
        if penalty > 0 {
            for _ in 0..penalty {
                match self.draw_one() {
                    Some(drawn) => self.players[next].hand.push(drawn),
                    None => break,
                }
            }
        }
        if penalty > 0 || card.value == card::Value::Skip {
            next = self.next_seat(next);
        }
        self.current = next;
        Ok(())
    }

    fn next_seat(&self, from: usize) -> usize {
        let n = self.players.len();
        match self.direction {
            Direction::Clockwise => (from + 1) % n,
            Direction::Counterclockwise => (from + n - 1) % n,
        }
    }

    /// Take the top of the draw pile, reshuffling the discards under the top
    /// card back in when it runs dry.
    fn draw_one(&mut self) -> Option<Card> {
        if self.draw_pile.is_empty() && self.discard_pile.len() > 1 {
            let top = self.discard_pile.pop()?;
            let mut recycled = std::mem::replace(&mut self.discard_pile, vec![top]);
            // Recycled cards go under in reverse so play order is not replayed.
            recycled.reverse();
            self.draw_pile = recycled;
            tracing::debug!(cards = self.draw_pile.len(), "discard pile recycled");
        }
        self.draw_pile.pop()
    }

    /// Let bots take their turns until a person is up or the game ends.
    ///
    /// Returns how many moves were made.
    pub fn advance_bots(&mut self) -> usize {
        let mut moves = 0;
        while !self.is_over() && self.current_player().bot && moves < MAX_BOT_MOVES {
            let seat = self.current;
            let decision = match self.top_card() {
                Some(top) => ai::decide(&self.players[seat].hand, top, self.active_colour),
                None => ai::Decision::Draw,
            };
            let action = decision.into_action(self.turn);
            if let Err(e) = self.apply_in_place(seat, &action) {
                // A bot only proposes playable cards; fall back to drawing.
                tracing::warn!(seat, error = %e, "bot move rejected, drawing instead");
                let draw = Action::Draw { turn: self.turn };
                if self.apply_in_place(seat, &draw).is_err() {
                    break;
                }
            }
            moves += 1;
        }
        moves
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::card::Value;

    fn people() -> Vec<Seat> {
        vec![Seat::new("host", "Host"), Seat::new("p1", "Alice")]
    }

    /// A small hand-built position: seat 0 to play on a red 5.
    fn position(hands: [Vec<Card>; 4]) -> GameState {
        let mut state = GameState::deal(&people(), 1);
        for (player, hand) in state.players.iter_mut().zip(hands) {
            player.hand = hand;
        }
        state.discard_pile = vec![Card::new(Colour::Red, Value::Number(5))];
        state.active_colour = Colour::Red;
        state.current = 0;
        state
    }

    fn red(n: u8) -> Card {
        Card::new(Colour::Red, Value::Number(n))
    }

    fn blue(n: u8) -> Card {
        Card::new(Colour::Blue, Value::Number(n))
    }

    #[test]
    fn deal_fills_table() {
        let state = GameState::deal(&people(), 42);
        assert_eq!(state.players.len(), SEATS);
        assert!(state.players.iter().all(|p| p.hand.len() == HAND_SIZE));
        assert_eq!(state.players[1].name, "Alice");
        assert!(!state.players[1].bot);
        assert!(state.players[2].bot && state.players[3].bot);
        assert!(state.top_card().unwrap().value.is_number());
        assert_eq!(state.turn, 0);
        assert_eq!(state.winner, None);

        let cards = state.draw_pile.len() + state.discard_pile.len() + SEATS * HAND_SIZE;
        assert_eq!(cards, card::DECK_SIZE);
    }

    #[test]
    fn deal_is_deterministic() {
        assert_eq!(GameState::deal(&people(), 9), GameState::deal(&people(), 9));
    }

    #[test]
    fn playing_a_card_moves_turn() {
        let state = position([vec![red(7), blue(1)], vec![blue(2)], vec![blue(3)], vec![blue(4)]]);
        let next = state
            .apply(0, &Action::Play { turn: 0, card_index: 0, colour: None })
            .unwrap();
        assert_eq!(next.turn, 1);
        assert_eq!(next.current, 1);
        assert_eq!(next.top_card(), Some(&red(7)));
        assert_eq!(next.players[0].hand, vec![blue(1)]);
        // The original is untouched.
        assert_eq!(state.turn, 0);
    }

    #[test]
    fn stale_and_out_of_turn_actions_rejected() {
        let state = position([vec![red(7)], vec![red(2)], vec![blue(3)], vec![blue(4)]]);
        assert_eq!(
            state.apply(0, &Action::Draw { turn: 3 }),
            Err(Rejected::StaleTurn { expected: 0, found: 3 })
        );
        assert_eq!(
            state.apply(1, &Action::Draw { turn: 0 }),
            Err(Rejected::NotYourTurn { seat: 1, current: 0 })
        );
        assert_eq!(
            state.apply(7, &Action::Draw { turn: 0 }),
            Err(Rejected::UnknownSeat(7))
        );
    }

    #[test]
    fn unplayable_card_rejected() {
        let state = position([vec![blue(7), red(1)], vec![], vec![], vec![]]);
        assert_eq!(
            state.apply(0, &Action::Play { turn: 0, card_index: 0, colour: None }),
            Err(Rejected::Unplayable(blue(7)))
        );
        assert_eq!(
            state.apply(0, &Action::Play { turn: 0, card_index: 5, colour: None }),
            Err(Rejected::InvalidCard(5))
        );
    }

    #[test]
    fn last_card_wins() {
        let state = position([vec![red(7)], vec![blue(2)], vec![blue(3)], vec![blue(4)]]);
        let next = state
            .apply(0, &Action::Play { turn: 0, card_index: 0, colour: None })
            .unwrap();
        assert_eq!(next.winner, Some(0));
        assert_eq!(
            next.apply(1, &Action::Draw { turn: 1 }),
            Err(Rejected::GameOver)
        );
    }

    #[test]
    fn skip_jumps_a_seat() {
        let skip = Card::new(Colour::Red, Value::Skip);
        let state = position([vec![skip, blue(1)], vec![blue(2)], vec![blue(3)], vec![blue(4)]]);
        let next = state
            .apply(0, &Action::Play { turn: 0, card_index: 0, colour: None })
            .unwrap();
        assert_eq!(next.current, 2);
    }

    #[test]
    fn reverse_changes_direction() {
        let reverse = Card::new(Colour::Red, Value::Reverse);
        let state = position([vec![reverse, blue(1)], vec![blue(2)], vec![blue(3)], vec![blue(4)]]);
        let next = state
            .apply(0, &Action::Play { turn: 0, card_index: 0, colour: None })
            .unwrap();
        assert_eq!(next.direction, Direction::Counterclockwise);
        assert_eq!(next.current, 3);
    }

    #[test]
    fn draw_two_penalises_next_seat() {
        let plus_two = Card::new(Colour::Red, Value::DrawTwo);
        let state = position([
            vec![plus_two, blue(1)],
            vec![blue(2)],
            vec![blue(3)],
            vec![blue(4)],
        ]);
        let next = state
            .apply(0, &Action::Play { turn: 0, card_index: 0, colour: None })
            .unwrap();
        assert_eq!(next.players[1].hand.len(), 3);
        assert_eq!(next.current, 2);
        assert_eq!(next.draw_pile.len(), state.draw_pile.len() - 2);
    }

    #[test]
    fn wild_sets_named_colour() {
        let wild = Card::new(Colour::Wild, Value::WildDrawFour);
        let state = position([vec![wild, blue(1)], vec![blue(2)], vec![blue(3)], vec![blue(4)]]);
        let next = state
            .apply(0, &Action::Play { turn: 0, card_index: 0, colour: Some(Colour::Green) })
            .unwrap();
        assert_eq!(next.active_colour, Colour::Green);
        assert_eq!(next.players[1].hand.len(), 5);
        assert_eq!(next.current, 2);

        let defaulted = state
            .apply(0, &Action::Play { turn: 0, card_index: 0, colour: None })
            .unwrap();
        assert_eq!(defaulted.active_colour, Colour::Blue);

        assert_eq!(
            state.apply(0, &Action::Play { turn: 0, card_index: 0, colour: Some(Colour::Wild) }),
            Err(Rejected::InvalidColour)
        );
    }

    #[test]
    fn draw_recycles_discards() {
        let mut state = position([vec![blue(1)], vec![blue(2)], vec![blue(3)], vec![blue(4)]]);
        state.draw_pile.clear();
        state.discard_pile = vec![red(1), red(2), red(3)];

        let next = state.apply(0, &Action::Draw { turn: 0 }).unwrap();
        assert_eq!(next.discard_pile, vec![red(3)]);
        assert_eq!(next.players[0].hand.len(), 2);
        assert_eq!(next.draw_pile.len(), 1);
        assert_eq!(next.current, 1);
    }

    #[test]
    fn draw_from_nothing_still_passes() {
        let mut state = position([vec![blue(1)], vec![blue(2)], vec![blue(3)], vec![blue(4)]]);
        state.draw_pile.clear();

        let next = state.apply(0, &Action::Draw { turn: 0 }).unwrap();
        assert_eq!(next.players[0].hand.len(), 1);
        assert_eq!(next.current, 1);
        assert_eq!(next.turn, 1);
    }

    #[test]
    fn bots_play_until_a_person_is_up() {
        let mut state = GameState::deal(&[Seat::new("host", "Host")], 3);
        state.current = 1;
        let moves = state.advance_bots();
        assert!(state.is_over() || !state.current_player().bot);
        assert!(moves >= 1);
        assert_eq!(state.turn, moves as u64);
    }

    #[test]
    fn action_wire_shape() {
        let json = serde_json::to_value(Action::Play {
            turn: 4,
            card_index: 2,
            colour: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "play", "turn": 4, "card_index": 2}));
        let back: Action =
            serde_json::from_value(serde_json::json!({"type": "draw", "turn": 1})).unwrap();
        assert_eq!(back, Action::Draw { turn: 1 });
    }
}
