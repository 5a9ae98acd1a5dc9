//! The discover → validate → publish state machine (§4.1.4). Optional and
//! co-located with the Coordinator; records every transition with a
//! timestamp and, on failure, the error that caused it.

use std::time::{Duration, Instant};

use crate::address::Address;
use crate::error::CoordinatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Discovering,
    Validating,
    Publishing,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub at: Instant,
    pub error: Option<String>,
}

pub struct StateMachineConfig {
    pub stage_timeout: Duration,
    pub max_retries: u32,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

/// Drives one discover→validate→publish cycle. `discover`, `validate`, and
/// `publish` are the three callbacks the Coordinator binds in (§4.1.4):
/// discovery combines interface-scan IPs with listen ports, validation runs
/// dial-back (or passes through if disabled), and publish credits each
/// validated address as verified.
pub async fn run<D, V, P, DFut, VFut, PFut>(
    config: &StateMachineConfig,
    mut discover: D,
    mut validate: V,
    mut publish: P,
) -> (Vec<Transition>, Result<(), CoordinatorError>)
where
    D: FnMut() -> DFut,
    V: FnMut(Vec<Address>) -> VFut,
    P: FnMut(Vec<Address>) -> PFut,
    DFut: std::future::Future<Output = Result<Vec<Address>, CoordinatorError>>,
    VFut: std::future::Future<Output = Result<Vec<Address>, CoordinatorError>>,
    PFut: std::future::Future<Output = Result<(), CoordinatorError>>,
{
    let mut transitions = Vec::new();
    let mut state = State::Idle;
    let mut retries_left = config.max_retries;

    record(&mut transitions, &mut state, State::Discovering, None);

    loop {
        let discovered = match async_std::future::timeout(config.stage_timeout, discover()).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                if !retry(&mut transitions, &mut state, &mut retries_left, e.to_string()) {
                    return (transitions, Err(e));
                }
                continue;
            }
            Err(_) => {
                let e = CoordinatorError::RetriesExhausted;
                if !retry(&mut transitions, &mut state, &mut retries_left, "discover stage timed out".into()) {
                    return (transitions, Err(e));
                }
                continue;
            }
        };

        record(&mut transitions, &mut state, State::Validating, None);
        let validated = match async_std::future::timeout(config.stage_timeout, validate(discovered)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                if !retry(&mut transitions, &mut state, &mut retries_left, e.to_string()) {
                    return (transitions, Err(e));
                }
                continue;
            }
            Err(_) => {
                if !retry(&mut transitions, &mut state, &mut retries_left, "validate stage timed out".into()) {
                    return (transitions, Err(CoordinatorError::RetriesExhausted));
                }
                continue;
            }
        };

        record(&mut transitions, &mut state, State::Publishing, None);
        match async_std::future::timeout(config.stage_timeout, publish(validated)).await {
            Ok(Ok(())) => {
                record(&mut transitions, &mut state, State::Complete, None);
                return (transitions, Ok(()));
            }
            Ok(Err(e)) => {
                if !retry(&mut transitions, &mut state, &mut retries_left, e.to_string()) {
                    return (transitions, Err(e));
                }
            }
            Err(_) => {
                if !retry(&mut transitions, &mut state, &mut retries_left, "publish stage timed out".into()) {
                    return (transitions, Err(CoordinatorError::RetriesExhausted));
                }
            }
        }
    }
}

fn record(transitions: &mut Vec<Transition>, state: &mut State, to: State, error: Option<String>) {
    transitions.push(Transition {
        from: *state,
        to,
        at: Instant::now(),
        error,
    });
    *state = to;
}

/// On failure: decrement retries and loop back to `Discovering`, or
/// transition to terminal `Failed` when retries are exhausted.
fn retry(
    transitions: &mut Vec<Transition>,
    state: &mut State,
    retries_left: &mut u32,
    error: String,
) -> bool {
    if *retries_left == 0 {
        record(transitions, state, State::Failed, Some(error));
        false
    } else {
        *retries_left -= 1;
        record(transitions, state, State::Discovering, Some(error));
        true
    }
}
