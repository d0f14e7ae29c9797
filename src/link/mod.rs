//! Per-device connection state machine.
//!
//! Same function-pointer engine as the rest of the firmware:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  StateTable                                                    │
//! │  ┌────────────────┬───────────┬──────────┬──────────────────┐  │
//! │  │ StateId        │ on_enter  │ on_exit  │ on_update        │  │
//! │  ├────────────────┼───────────┼──────────┼──────────────────┤  │
//! │  │ Idle           │ fn(ctx)   │ -        │ fn(ctx)->Option  │  │
//! │  │ PendingConnect │ fn(ctx)   │ -        │ fn(ctx)->Option  │  │
//! │  │ Authenticating │ -         │ -        │ fn(ctx)->Option  │  │
//! │  │ Configuring    │ fn(ctx)   │ -        │ fn(ctx)->Option  │  │
//! │  │ Subscribed     │ fn(ctx)   │ -        │ fn(ctx)->Option  │  │
//! │  │ Closing        │ fn(ctx)   │ -        │ fn(ctx)->Option  │  │
//! │  └────────────────┴───────────┴──────────┴──────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each tick calls `on_update` for the current state.  `Some(next)` runs
//! `on_exit(current)`, then `on_enter(next)`.  The context is rebuilt
//! for every tick from borrowed parts, so one engine per slot suffices.

pub mod context;
pub mod states;

use context::{LinkContext, LinkScratch};
use log::debug;

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StateId {
    Idle = 0,
    PendingConnect = 1,
    Authenticating = 2,
    Configuring = 3,
    Subscribed = 4,
    Closing = 5,
}

impl StateId {
    pub const COUNT: usize = 6;

    /// Out-of-range indices map to `Closing`.
    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Idle,
            1 => Self::PendingConnect,
            2 => Self::Authenticating,
            3 => Self::Configuring,
            4 => Self::Subscribed,
            5 => Self::Closing,
            _ => {
                debug_assert!(false, "invalid link state index: {idx}");
                Self::Closing
            }
        }
    }

    /// States holding a transport attempt in flight.
    pub const fn in_handshake(self) -> bool {
        matches!(self, Self::PendingConnect | Self::Authenticating | Self::Configuring)
    }
}

// ---------------------------------------------------------------------------
// Function-pointer type aliases
// ---------------------------------------------------------------------------

pub type StateActionFn = fn(&mut LinkContext<'_>);

pub type StateUpdateFn = fn(&mut LinkContext<'_>) -> Option<StateId>;

pub struct StateDescriptor {
    pub id: StateId,
    pub name: &'static str,
    pub on_enter: Option<StateActionFn>,
    pub on_exit: Option<StateActionFn>,
    pub on_update: StateUpdateFn,
}

// ---------------------------------------------------------------------------
// FSM engine
// ---------------------------------------------------------------------------

pub struct Fsm {
    table: [StateDescriptor; StateId::COUNT],
    current: usize,
    /// Time the current state was entered.
    entered_ms: u64,
}

impl Fsm {
    pub fn new(table: [StateDescriptor; StateId::COUNT], initial: StateId) -> Self {
        Self {
            table,
            current: initial as usize,
            entered_ms: 0,
        }
    }

    /// Advance by one tick.  Returns the transition taken, if any.
    pub fn tick(&mut self, ctx: &mut LinkContext<'_>) -> Option<(StateId, StateId)> {
        let from = self.current_state();
        let next = (self.table[self.current].on_update)(ctx)?;
        self.transition(next, ctx);
        Some((from, next))
    }

    /// Jump to `next` regardless of what `on_update` would return.
    pub fn force_transition(&mut self, next: StateId, ctx: &mut LinkContext<'_>) -> Option<(StateId, StateId)> {
        let from = self.current_state();
        if next == from {
            return None;
        }
        self.transition(next, ctx);
        Some((from, next))
    }

    pub fn current_state(&self) -> StateId {
        StateId::from_index(self.current)
    }

    pub fn state_name(&self) -> &'static str {
        self.table[self.current].name
    }

    pub fn time_in_state(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.entered_ms)
    }

    fn transition(&mut self, next_id: StateId, ctx: &mut LinkContext<'_>) {
        let next_idx = next_id as usize;
        debug!(
            "link {}: {} -> {}",
            ctx.slot, self.table[self.current].name, self.table[next_idx].name
        );

        if let Some(exit) = self.table[self.current].on_exit {
            exit(ctx);
        }

        self.current = next_idx;
        self.entered_ms = ctx.now_ms;

        if let Some(enter) = self.table[self.current].on_enter {
            enter(ctx);
        }
    }
}

/// One slot's state machine plus the scratch it carries between ticks.
pub struct Link {
    pub fsm: Fsm,
    pub scratch: LinkScratch,
}

impl Link {
    pub fn new() -> Self {
        Self {
            fsm: Fsm::new(states::build_state_table(), StateId::Idle),
            scratch: LinkScratch::default(),
        }
    }

    pub fn state(&self) -> StateId {
        self.fsm.current_state()
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}
