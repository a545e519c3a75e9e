//! # Actors and Roles
//!
//! A role is not a property of a user. The same user is a client on one job
//! and a freelancer on another, so the API layer resolves the caller's role
//! against the job being acted on before handing an [`Actor`] to a
//! transition function. Arbiters and the system actor are granted by
//! credentials rather than by job membership.

use serde::{Deserialize, Serialize};

use crate::identity::UserId;

/// The capacity in which an actor is requesting a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Owner of the job.
    Client,
    /// Freelancer assigned to (or bidding on) the job.
    Freelancer,
    /// Platform arbiter empowered to resolve disputes.
    Arbiter,
    /// Internal actor for sweeps and settlement-driven transitions.
    System,
    /// Authenticated user with no relationship to the job.
    Visitor,
}

impl Role {
    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Freelancer => "freelancer",
            Self::Arbiter => "arbiter",
            Self::System => "system",
            Self::Visitor => "visitor",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The requesting party of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// The user behind the request. `None` only for [`Role::System`].
    pub user_id: Option<UserId>,
    /// Role resolved against the target job.
    pub role: Role,
}

impl Actor {
    /// A job's client.
    pub fn client(user: UserId) -> Self {
        Self {
            user_id: Some(user),
            role: Role::Client,
        }
    }

    /// A job's freelancer.
    pub fn freelancer(user: UserId) -> Self {
        Self {
            user_id: Some(user),
            role: Role::Freelancer,
        }
    }

    /// A platform arbiter.
    pub fn arbiter(user: UserId) -> Self {
        Self {
            user_id: Some(user),
            role: Role::Arbiter,
        }
    }

    /// A user unrelated to the job.
    pub fn visitor(user: UserId) -> Self {
        Self {
            user_id: Some(user),
            role: Role::Visitor,
        }
    }

    /// The internal system actor.
    pub fn system() -> Self {
        Self {
            user_id: None,
            role: Role::System,
        }
    }

    /// Whether the actor holds one of `roles`.
    pub fn is_one_of(&self, roles: &[Role]) -> bool {
        roles.contains(&self.role)
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.user_id {
            Some(id) => write!(f, "{}:{}", self.role, id),
            None => write!(f, "{}", self.role),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_role() {
        let u = UserId::new();
        assert_eq!(Actor::client(u).role, Role::Client);
        assert_eq!(Actor::freelancer(u).role, Role::Freelancer);
        assert_eq!(Actor::arbiter(u).role, Role::Arbiter);
        assert_eq!(Actor::visitor(u).role, Role::Visitor);
        assert_eq!(Actor::system().user_id, None);
    }

    #[test]
    fn is_one_of_matches_listed_roles() {
        let a = Actor::client(UserId::new());
        assert!(a.is_one_of(&[Role::Client, Role::Arbiter]));
        assert!(!a.is_one_of(&[Role::Freelancer]));
    }

    #[test]
    fn display_includes_user() {
        let u = UserId::new();
        assert_eq!(Actor::arbiter(u).to_string(), format!("arbiter:{u}"));
        assert_eq!(Actor::system().to_string(), "system");
    }
}
