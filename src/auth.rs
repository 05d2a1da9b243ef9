//! Authorization predicates evaluated by the engines
use super::error::MarketError;
use super::types::{Actor, Role};

pub fn require_role(actor: &Actor, role: Role) -> Result<(), MarketError> {
    if actor.role != role {
        return Err(MarketError::Forbidden(format!(
            "user '{}' acts as {:?}, operation requires {:?}",
            actor.user_id, actor.role, role
        )));
    }
    Ok(())
}

/// The actor must be the recorded owner of the entity.
pub fn require_owner(actor: &Actor, owner: &str, what: &str) -> Result<(), MarketError> {
    if actor.user_id != owner {
        return Err(MarketError::Forbidden(format!(
            "user '{}' does not own {what}",
            actor.user_id
        )));
    }
    Ok(())
}

/// Owners see their own records, regulators see everything.
pub fn require_owner_or_regulator(actor: &Actor, owner: &str, what: &str) -> Result<(), MarketError> {
    if actor.role == Role::Regulator {
        return Ok(());
    }
    require_owner(actor, owner, what)
}
