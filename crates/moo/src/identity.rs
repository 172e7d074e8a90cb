use {async_trait::async_trait, moobridge_common::UserId};

/// Maps a chat platform user to a MOO player name used in the login line.
#[async_trait]
pub trait PlayerResolver: Send + Sync {
    /// `None` means connect without logging in.
    async fn resolve_player_name(&self, user: &UserId) -> Option<String>;
}

/// Resolution against the MOO player database is not wired up yet; every
/// lookup comes back empty and sessions stay unauthenticated.
pub struct UnresolvedPlayers;

#[async_trait]
impl PlayerResolver for UnresolvedPlayers {
    async fn resolve_player_name(&self, _user: &UserId) -> Option<String> {
        None
    }
}

/// Uses the chat identity verbatim as the player name.
pub struct PassthroughResolver;

#[async_trait]
impl PlayerResolver for PassthroughResolver {
    async fn resolve_player_name(&self, user: &UserId) -> Option<String> {
        Some(user.as_str().to_string())
    }
}
