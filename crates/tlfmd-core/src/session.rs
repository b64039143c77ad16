//! Identity-layer collaborators the store needs: who is calling, and team
//! membership.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::types::{CryptPublicKey, TeamId, UserId, VerifyingKey};

/// The logged-in user and device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub uid: UserId,
    pub name: String,
    pub verifying_key: VerifyingKey,
    pub crypt_public_key: CryptPublicKey,
}

#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn current_session(&self, ctx: &RequestContext) -> anyhow::Result<Session>;
}

/// Always answers with the same session.
#[derive(Debug, Clone)]
pub struct StaticSession(pub Session);

#[async_trait]
impl SessionSource for StaticSession {
    async fn current_session(&self, _ctx: &RequestContext) -> anyhow::Result<Session> {
        Ok(self.0.clone())
    }
}

/// Current team membership.
#[async_trait]
pub trait TeamMembership: Send + Sync {
    async fn is_team_writer(
        &self,
        ctx: &RequestContext,
        team: &TeamId,
        uid: &UserId,
        key: &VerifyingKey,
    ) -> anyhow::Result<bool>;

    async fn is_team_reader(&self, ctx: &RequestContext, team: &TeamId, uid: &UserId) -> anyhow::Result<bool>;
}

/// Membership source for deployments without team folders.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTeams;

#[async_trait]
impl TeamMembership for NoTeams {
    async fn is_team_writer(
        &self,
        _ctx: &RequestContext,
        _team: &TeamId,
        _uid: &UserId,
        _key: &VerifyingKey,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn is_team_reader(&self, _ctx: &RequestContext, _team: &TeamId, _uid: &UserId) -> anyhow::Result<bool> {
        Ok(false)
    }
}
