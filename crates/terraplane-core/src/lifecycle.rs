use crate::CoreError;
use terraplane_schema::ProvisionState;

/// Check a lifecycle transition against the state machine.
///
/// Provision: `Pending -> Initializing -> Planning -> Applying -> Completed`.
/// Destroy: `Pending -> Destroying -> Destroyed`. Any non-terminal state may
/// move to `Failed`; terminal states never move.
pub fn validate_transition(from: ProvisionState, to: ProvisionState) -> Result<(), CoreError> {
    use ProvisionState::{
        Applying, Completed, Destroyed, Destroying, Failed, Initializing, Pending, Planning,
    };

    let valid = matches!(
        (from, to),
        (Pending, Initializing | Destroying)
            | (Initializing, Planning)
            | (Planning, Applying)
            | (Applying, Completed)
            | (Destroying, Destroyed)
            | (Pending | Initializing | Planning | Applying | Destroying, Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProvisionState::{
        Applying, Completed, Destroyed, Destroying, Failed, Initializing, Pending, Planning,
    };

    const ALL: [ProvisionState; 8] = [
        Pending,
        Initializing,
        Planning,
        Applying,
        Completed,
        Destroying,
        Destroyed,
        Failed,
    ];

    #[test]
    fn valid_transitions() {
        assert!(validate_transition(Pending, Initializing).is_ok());
        assert!(validate_transition(Initializing, Planning).is_ok());
        assert!(validate_transition(Planning, Applying).is_ok());
        assert!(validate_transition(Applying, Completed).is_ok());
        assert!(validate_transition(Pending, Destroying).is_ok());
        assert!(validate_transition(Destroying, Destroyed).is_ok());
        for from in [Pending, Initializing, Planning, Applying, Destroying] {
            assert!(validate_transition(from, Failed).is_ok(), "{from} -> failed");
        }
    }

    #[test]
    fn invalid_transitions() {
        assert!(validate_transition(Pending, Planning).is_err());
        assert!(validate_transition(Pending, Completed).is_err());
        assert!(validate_transition(Planning, Initializing).is_err());
        assert!(validate_transition(Applying, Planning).is_err());
        assert!(validate_transition(Initializing, Destroying).is_err());
        assert!(validate_transition(Destroying, Completed).is_err());
        assert!(validate_transition(Applying, Destroyed).is_err());
    }

    #[test]
    fn terminal_states_never_move() {
        for from in [Completed, Destroyed, Failed] {
            for to in ALL {
                assert!(validate_transition(from, to).is_err(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn no_self_transitions() {
        for s in ALL {
            assert!(validate_transition(s, s).is_err(), "{s} -> {s}");
        }
    }
}
