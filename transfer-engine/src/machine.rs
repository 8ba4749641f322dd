//! Generic operation state machine
//!
//! A [`StateMachine`] is a data-defined graph: an initial state, a set of
//! terminal states and a table of [`Transition`]s. One engine interprets every
//! graph, so legality checks, guards, hooks and logging live in one place.
//!
//! `fire` runs in this order:
//!
//! 1. `InvalidTransition` unless the current state is in the transition's
//!    from-states
//! 2. `GuardRejected` naming the first guard that returns false (nothing
//!    runs)
//! 3. before-hook, then status write and [`TransitionContext::commit`]; a
//!    failure in either restores the instance and nothing is persisted
//! 4. after-hook; its failure is reported in [`Fired::after_hook_error`] and
//!    the committed status stands
//!
//! After-hooks must derive their work from the persisted instance alone:
//! [`StateMachine::rerun_after_hook`] replays them after a crash, so a state
//! may be entered through at most one hooked transition.

use crate::{Error, Result};
use std::fmt;
use uuid::Uuid;

/// Something a state machine can drive
pub trait Stateful: Clone {
    /// State type
    type State: Copy + Eq + fmt::Debug + fmt::Display;
    /// Event type
    type Event: Copy + Eq + fmt::Debug + fmt::Display;

    /// Identifier used in logs
    fn id(&self) -> Uuid;
    /// Current state
    fn state(&self) -> Self::State;
    /// Overwrite the state
    fn set_state(&mut self, state: Self::State);
}

/// Persistence seam: makes a transition durable
pub trait TransitionContext<T> {
    /// Persist `instance` (already carrying its new state)
    ///
    /// `after_hook` is set when an after-hook runs once the commit returns;
    /// the context records that in the same write so a crash in between can
    /// be replayed.
    fn commit(&self, instance: &mut T, after_hook: bool) -> Result<()>;
}

type GuardFn<T, C> = Box<dyn Fn(&T, &C) -> bool + Send + Sync>;
type HookFn<T, C> = Box<dyn Fn(&mut T, &C) -> Result<()> + Send + Sync>;

/// Named predicate that must hold for a transition to run
pub struct Guard<T, C> {
    name: &'static str,
    check: GuardFn<T, C>,
}

/// One edge set: `from-states --event--> to`
pub struct Transition<T: Stateful, C> {
    event: T::Event,
    from: Vec<T::State>,
    to: T::State,
    guards: Vec<Guard<T, C>>,
    before: Option<HookFn<T, C>>,
    after: Option<HookFn<T, C>>,
}

impl<T: Stateful, C> Transition<T, C> {
    /// New transition without guard or hooks
    pub fn new(event: T::Event, from: impl IntoIterator<Item = T::State>, to: T::State) -> Self {
        Self {
            event,
            from: from.into_iter().collect(),
            to,
            guards: Vec::new(),
            before: None,
            after: None,
        }
    }

    /// Add a guard; guards are checked in the order they were added
    pub fn guard(
        mut self,
        name: &'static str,
        check: impl Fn(&T, &C) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.guards.push(Guard {
            name,
            check: Box::new(check),
        });
        self
    }

    /// Add a before-hook
    pub fn before(
        mut self,
        hook: impl Fn(&mut T, &C) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.before = Some(Box::new(hook));
        self
    }

    /// Add an after-hook
    pub fn after(
        mut self,
        hook: impl Fn(&mut T, &C) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.after = Some(Box::new(hook));
        self
    }
}

impl<T, C> fmt::Debug for Guard<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("name", &self.name).finish()
    }
}

impl<T: Stateful, C> fmt::Debug for Transition<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("event", &self.event)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("guards", &self.guards)
            .finish_non_exhaustive()
    }
}

/// Outcome of a committed transition
#[derive(Debug)]
pub struct Fired<S> {
    /// State before
    pub from: S,
    /// State after
    pub to: S,
    /// Whether the transition has an after-hook
    pub after_hook: bool,
    /// After-hook failure, if any; the transition itself is committed
    pub after_hook_error: Option<Error>,
}

/// State graph plus interpreter
pub struct StateMachine<T: Stateful, C> {
    name: &'static str,
    initial: T::State,
    terminal: Vec<T::State>,
    transitions: Vec<Transition<T, C>>,
}

impl<T: Stateful, C> fmt::Debug for StateMachine<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.name)
            .field("initial", &self.initial)
            .field("terminal", &self.terminal)
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

impl<T: Stateful, C: TransitionContext<T>> StateMachine<T, C> {
    /// Empty graph
    pub fn new(name: &'static str, initial: T::State) -> Self {
        Self {
            name,
            initial,
            terminal: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Mark terminal states
    pub fn terminal(mut self, states: impl IntoIterator<Item = T::State>) -> Self {
        self.terminal.extend(states);
        self
    }

    /// Add a transition
    pub fn transition(mut self, transition: Transition<T, C>) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Graph name (the operation kind)
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Initial state
    pub fn initial(&self) -> T::State {
        self.initial
    }

    /// Whether `state` has no outgoing transitions by declaration
    pub fn is_terminal(&self, state: T::State) -> bool {
        self.terminal.contains(&state)
    }

    /// Events with an edge out of `state`
    pub fn events_from(&self, state: T::State) -> Vec<T::Event> {
        let mut events: Vec<T::Event> = Vec::new();
        for t in self.transitions.iter().filter(|t| t.from.contains(&state)) {
            if !events.contains(&t.event) {
                events.push(t.event);
            }
        }
        events
    }

    /// Target of `event` from `state`, ignoring guards
    pub fn target(&self, state: T::State, event: T::Event) -> Option<T::State> {
        self.find(state, event).map(|t| t.to)
    }

    /// Whether `fire` would pass the legality and guard checks
    pub fn may_fire(&self, event: T::Event, instance: &T, ctx: &C) -> bool {
        match self.find(instance.state(), event) {
            Some(t) => t.guards.iter().all(|g| (g.check)(instance, ctx)),
            None => false,
        }
    }

    /// Fire `event` on `instance`
    pub fn fire(&self, event: T::Event, instance: &mut T, ctx: &C) -> Result<Fired<T::State>> {
        let from = instance.state();
        let transition = self.find(from, event).ok_or_else(|| Error::InvalidTransition {
            kind: self.name,
            status: from.to_string(),
            event: event.to_string(),
        })?;

        if let Some(guard) = transition.guards.iter().find(|g| !(g.check)(instance, ctx)) {
            tracing::debug!(
                operation_id = %instance.id(),
                kind = self.name,
                %event,
                %from,
                guard = guard.name,
                "Guard rejected transition"
            );
            return Err(Error::GuardRejected {
                kind: self.name,
                status: from.to_string(),
                event: event.to_string(),
                guard: guard.name,
            });
        }

        let backup = instance.clone();
        let mut committed = match &transition.before {
            Some(hook) => hook(instance, ctx),
            None => Ok(()),
        };
        if committed.is_ok() {
            instance.set_state(transition.to);
            committed = ctx.commit(instance, transition.after.is_some());
        }
        if let Err(err) = committed {
            *instance = backup;
            tracing::debug!(
                operation_id = %instance.id(),
                kind = self.name,
                %event,
                %from,
                error = %err,
                "Transition aborted before commit"
            );
            return Err(err);
        }

        tracing::info!(
            operation_id = %instance.id(),
            kind = self.name,
            %event,
            %from,
            to = %transition.to,
            "Transition committed"
        );

        let after_hook_error = match &transition.after {
            Some(hook) => hook(instance, ctx).err(),
            None => None,
        };
        if let Some(err) = &after_hook_error {
            tracing::error!(
                operation_id = %instance.id(),
                kind = self.name,
                %event,
                error = %err,
                "After-hook failed; status change stands"
            );
        }

        Ok(Fired {
            from,
            to: transition.to,
            after_hook: transition.after.is_some(),
            after_hook_error,
        })
    }

    /// Run the after-hook of the transition that enters the current state
    ///
    /// Returns `Ok(false)` when that state has no after-hook.
    pub fn rerun_after_hook(&self, instance: &mut T, ctx: &C) -> Result<bool> {
        let state = instance.state();
        let Some(hook) = self
            .transitions
            .iter()
            .filter(|t| t.to == state)
            .find_map(|t| t.after.as_ref())
        else {
            return Ok(false);
        };
        tracing::debug!(
            operation_id = %instance.id(),
            kind = self.name,
            %state,
            "Replaying after-hook"
        );
        hook(instance, ctx)?;
        Ok(true)
    }

    /// Transitions into `state` that carry an after-hook
    pub fn hooked_entries(&self, state: T::State) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.to == state && t.after.is_some())
            .count()
    }

    fn find(&self, state: T::State, event: T::Event) -> Option<&Transition<T, C>> {
        self.transitions
            .iter()
            .find(|t| t.event == event && t.from.contains(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Off,
        On,
        Broken,
    }

    impl fmt::Display for Light {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Switch {
        Flip,
        Smash,
    }

    impl fmt::Display for Switch {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Lamp {
        id: Uuid,
        state: Light,
        flips: u32,
        note: Option<String>,
    }

    impl Stateful for Lamp {
        type State = Light;
        type Event = Switch;

        fn id(&self) -> Uuid {
            self.id
        }
        fn state(&self) -> Light {
            self.state
        }
        fn set_state(&mut self, state: Light) {
            self.state = state;
        }
    }

    #[derive(Default)]
    struct Recorder {
        commits: RefCell<Vec<(Light, bool)>>,
        fail_commit: bool,
        allow: bool,
    }

    impl TransitionContext<Lamp> for Recorder {
        fn commit(&self, lamp: &mut Lamp, after_hook: bool) -> Result<()> {
            if self.fail_commit {
                return Err(Error::Hook("disk full".into()));
            }
            self.commits.borrow_mut().push((lamp.state, after_hook));
            Ok(())
        }
    }

    fn lamp() -> Lamp {
        Lamp {
            id: Uuid::now_v7(),
            state: Light::Off,
            flips: 0,
            note: None,
        }
    }

    fn machine() -> StateMachine<Lamp, Recorder> {
        StateMachine::new("lamp", Light::Off)
            .terminal([Light::Broken])
            .transition(
                Transition::new(Switch::Flip, [Light::Off], Light::On)
                    .guard("allowed", |_, ctx: &Recorder| ctx.allow)
                    .guard("intact", |lamp: &Lamp, _| lamp.note.is_none())
                    .before(|lamp: &mut Lamp, _| {
                        lamp.flips += 1;
                        Ok(())
                    }),
            )
            .transition(Transition::new(Switch::Flip, [Light::On], Light::Off))
            .transition(
                Transition::new(Switch::Smash, [Light::Off, Light::On], Light::Broken).after(
                    |lamp: &mut Lamp, _| {
                        lamp.note = Some("after ran".into());
                        Err(Error::Hook("alarm offline".into()))
                    },
                ),
            )
    }

    #[test]
    fn test_fire_runs_before_hook_and_commits() {
        let ctx = Recorder {
            allow: true,
            ..Default::default()
        };
        let mut lamp = lamp();
        let fired = machine().fire(Switch::Flip, &mut lamp, &ctx).unwrap();

        assert_eq!((fired.from, fired.to), (Light::Off, Light::On));
        assert_eq!(lamp.flips, 1);
        assert_eq!(*ctx.commits.borrow(), vec![(Light::On, false)]);
    }

    #[test]
    fn test_invalid_transition_mutates_nothing() {
        let ctx = Recorder {
            allow: true,
            ..Default::default()
        };
        let mut lamp = lamp();
        lamp.state = Light::Broken;
        let before = lamp.clone();

        let err = machine().fire(Switch::Flip, &mut lamp, &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { kind: "lamp", .. }));
        assert_eq!(lamp, before);
        assert!(ctx.commits.borrow().is_empty());
    }

    #[test]
    fn test_guard_rejection_runs_no_hooks() {
        let ctx = Recorder {
            allow: false,
            ..Default::default()
        };
        let mut lamp = lamp();

        let err = machine().fire(Switch::Flip, &mut lamp, &ctx).unwrap_err();
        assert!(matches!(
            err,
            Error::GuardRejected {
                guard: "allowed",
                ..
            }
        ));
        assert_eq!(lamp.flips, 0);
        assert_eq!(lamp.state, Light::Off);
        assert!(!machine().may_fire(Switch::Flip, &lamp, &ctx));
    }

    #[test]
    fn test_guards_checked_in_order() {
        let mut lamp = lamp();
        lamp.note = Some("cracked".into());

        let ctx = Recorder {
            allow: true,
            ..Default::default()
        };
        let err = machine().fire(Switch::Flip, &mut lamp, &ctx).unwrap_err();
        assert!(matches!(
            err,
            Error::GuardRejected {
                guard: "intact",
                ..
            }
        ));

        let ctx = Recorder::default();
        let err = machine().fire(Switch::Flip, &mut lamp, &ctx).unwrap_err();
        assert!(matches!(
            err,
            Error::GuardRejected {
                guard: "allowed",
                ..
            }
        ));
        assert_eq!(lamp.flips, 0);
    }

    #[test]
    fn test_commit_failure_restores_instance() {
        let ctx = Recorder {
            allow: true,
            fail_commit: true,
            ..Default::default()
        };
        let mut lamp = lamp();

        assert!(machine().fire(Switch::Flip, &mut lamp, &ctx).is_err());
        assert_eq!(lamp.state, Light::Off);
        assert_eq!(lamp.flips, 0);
    }

    #[test]
    fn test_after_hook_failure_keeps_status() {
        let ctx = Recorder::default();
        let mut lamp = lamp();

        let fired = machine().fire(Switch::Smash, &mut lamp, &ctx).unwrap();
        assert_eq!(lamp.state, Light::Broken);
        assert!(matches!(fired.after_hook_error, Some(Error::Hook(_))));
        assert_eq!(lamp.note.as_deref(), Some("after ran"));
        assert_eq!(*ctx.commits.borrow(), vec![(Light::Broken, true)]);
    }

    #[test]
    fn test_rerun_after_hook_uses_current_state() {
        let ctx = Recorder::default();
        let m = machine();

        let mut lamp = lamp();
        assert!(!m.rerun_after_hook(&mut lamp, &ctx).unwrap());
        assert_eq!(lamp.note, None);

        lamp.state = Light::Broken;
        assert!(m.rerun_after_hook(&mut lamp, &ctx).is_err());
        assert_eq!(lamp.note.as_deref(), Some("after ran"));
        assert!(ctx.commits.borrow().is_empty());
        assert_eq!(m.hooked_entries(Light::Broken), 1);
        assert_eq!(m.hooked_entries(Light::On), 0);
    }

    #[test]
    fn test_graph_queries() {
        let m = machine();
        assert_eq!(m.initial(), Light::Off);
        assert!(m.is_terminal(Light::Broken));
        assert_eq!(m.events_from(Light::Off), vec![Switch::Flip, Switch::Smash]);
        assert!(m.events_from(Light::Broken).is_empty());
        assert_eq!(m.target(Light::On, Switch::Flip), Some(Light::Off));
    }
}
