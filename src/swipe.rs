//! The repeat-swipe state machine: three grants by the same card within 30 s
//! toggles the door's persistent-unlocked flag. Modeled as an explicit state
//! machine per the design note, not three loose variables, so the
//! denial-reset rule is a single, visible transition.

use chrono::{DateTime, Utc};

const REPEAT_WINDOW: chrono::Duration = chrono::Duration::seconds(30);

/// `Idle`: no recent grant to compare against. `Observed`: tracking repeats
/// for `user_id` until `deadline`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Observed {
        user_id: String,
        repeat_count: u32,
        deadline: DateTime<Utc>,
    },
}

/// What the caller should do with `DoorIO` after a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeAction {
    /// First or non-repeat grant: brief unlock.
    UnlockBriefly,
    /// Already persistently unlocked; no hardware action, just a log note.
    AlreadyUnlocked,
    /// Third consecutive grant: toggle persistent-unlocked on.
    ToggleUnlock,
    /// Fourth consecutive grant (second toggle): toggle persistent-unlocked off.
    ToggleLock,
}

pub struct SwipeStateMachine {
    state: State,
    persistent_unlocked: bool,
}

impl SwipeStateMachine {
    pub fn new() -> Self {
        SwipeStateMachine {
            state: State::Idle,
            persistent_unlocked: false,
        }
    }

    /// Record a grant for `user_id` at `now` and decide the resulting action.
    pub fn on_grant(&mut self, user_id: &str, now: DateTime<Utc>) -> SwipeAction {
        let repeat_count = match &self.state {
            State::Observed { user_id: last, repeat_count, deadline } if last == user_id && now <= *deadline => {
                repeat_count + 1
            }
            _ => 0,
        };

        self.state = State::Observed {
            user_id: user_id.to_string(),
            repeat_count,
            deadline: now + REPEAT_WINDOW,
        };

        if repeat_count >= 2 {
            self.persistent_unlocked = !self.persistent_unlocked;
            if self.persistent_unlocked {
                SwipeAction::ToggleUnlock
            } else {
                SwipeAction::ToggleLock
            }
        } else if self.persistent_unlocked {
            SwipeAction::AlreadyUnlocked
        } else {
            SwipeAction::UnlockBriefly
        }
    }

    /// A denial resets the repeat counter but leaves `last_user` alone, so a
    /// mistaken swipe followed by a success still counts as "new user"
    /// (spec.md §4.7).
    pub fn on_deny(&mut self) {
        if let State::Observed { user_id, deadline, .. } = &self.state {
            self.state = State::Observed {
                user_id: user_id.clone(),
                repeat_count: 0,
                deadline: *deadline,
            };
        }
    }

    pub fn is_persistent_unlocked(&self) -> bool {
        self.persistent_unlocked
    }
}

impl Default for SwipeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_swipe_toggles_exactly_once() {
        let mut machine = SwipeStateMachine::new();
        let now = Utc::now();
        assert_eq!(machine.on_grant("42", now), SwipeAction::UnlockBriefly);
        assert_eq!(machine.on_grant("42", now), SwipeAction::UnlockBriefly);
        assert_eq!(machine.on_grant("42", now), SwipeAction::ToggleUnlock);
        assert!(machine.is_persistent_unlocked());
    }

    #[test]
    fn fourth_swipe_toggles_back_off() {
        let mut machine = SwipeStateMachine::new();
        let now = Utc::now();
        for _ in 0..3 {
            machine.on_grant("42", now);
        }
        assert!(machine.is_persistent_unlocked());
        assert_eq!(machine.on_grant("42", now), SwipeAction::ToggleLock);
        assert!(!machine.is_persistent_unlocked());
        assert_eq!(machine.on_grant("42", now), SwipeAction::ToggleUnlock);
        assert!(machine.is_persistent_unlocked());
    }

    #[test]
    fn denial_resets_count_but_not_last_user() {
        let mut machine = SwipeStateMachine::new();
        let now = Utc::now();
        machine.on_grant("42", now);
        machine.on_grant("42", now);
        machine.on_deny();
        assert_eq!(machine.on_grant("42", now), SwipeAction::UnlockBriefly, "deny resets the count, so this grant is only the first since the reset");
        assert_eq!(machine.on_grant("42", now), SwipeAction::ToggleUnlock, "two grants after the deny-reset still reach the toggle on the third overall since reset");
    }

    #[test]
    fn different_user_within_window_does_not_accumulate() {
        let mut machine = SwipeStateMachine::new();
        let now = Utc::now();
        machine.on_grant("42", now);
        machine.on_grant("42", now);
        assert_eq!(machine.on_grant("99", now), SwipeAction::UnlockBriefly);
    }

    #[test]
    fn repeat_outside_window_resets_count() {
        let mut machine = SwipeStateMachine::new();
        let now = Utc::now();
        machine.on_grant("42", now);
        machine.on_grant("42", now);
        let later = now + chrono::Duration::seconds(31);
        assert_eq!(machine.on_grant("42", later), SwipeAction::UnlockBriefly);
    }
}
