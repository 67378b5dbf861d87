//! The card game the room plays: cards, the turn rules and the bot player.

pub mod ai;
pub mod card;
pub mod state;

pub use ai::{decide, Decision};
pub use card::{Card, Colour, Value};
pub use state::{Action, Direction, GameState, Player, Rejected, Seat};

use crate::replicator::TurnEngine;

/// [`TurnEngine`] for [`GameState`]. Empty seats are played by bots after
/// every accepted action.
#[derive(Clone, Copy, Debug, Default)]
pub struct CardGame;

impl TurnEngine for CardGame {
    type State = GameState;
    type Action = Action;
    type Rejection = Rejected;

    fn apply(
        &self,
        state: &GameState,
        seat: usize,
        action: &Action,
    ) -> Result<GameState, Rejected> {
        state.apply(seat, action)
    }

    fn advance(&self, state: &mut GameState) {
        state.advance_bots();
    }
}
