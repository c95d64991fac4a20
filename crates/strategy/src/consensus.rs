use std::collections::BTreeMap;

use serde::Serialize;

use crate::Context;

/// Latest verdict of one binding. `signal == None` means "not decidable yet".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingState {
    pub interval: String,
    pub signal: Option<bool>,
    pub context: Context,
}

/// Binding states by name.
pub type ConsensusState = BTreeMap<String, BindingState>;

/// A binding state together with its name, as handed to a reducer.
#[derive(Debug, Clone, Copy)]
pub struct NamedState<'a> {
    pub name: &'a str,
    pub state: &'a BindingState,
}

impl NamedState<'_> {
    pub fn signal(&self) -> Option<bool> {
        self.state.signal
    }
}

/// A decidable result: the reduced signal and the full state it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consensus {
    pub signal: Option<bool>,
    pub state: ConsensusState,
}

/// Folds every binding's verdict into one signal.
pub trait ConsensusReducer: Send + Sync {
    fn reduce(&self, states: &[NamedState<'_>]) -> Option<bool>;
}

impl<F> ConsensusReducer for F
where
    F: Fn(&[NamedState<'_>]) -> Option<bool> + Send + Sync,
{
    fn reduce(&self, states: &[NamedState<'_>]) -> Option<bool> {
        self(states)
    }
}

/// The common signal when every binding agrees, `None` otherwise.
///
/// Any `None` entry makes the result `None`, as does an empty input.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unanimous;

impl ConsensusReducer for Unanimous {
    fn reduce(&self, states: &[NamedState<'_>]) -> Option<bool> {
        let (first, rest) = states.split_first()?;
        let signal = first.signal()?;
        rest.iter()
            .all(|s| s.signal() == Some(signal))
            .then_some(signal)
    }
}
