//! Only a repo collaborator's comments can advance
//! an issue's state.

use crate::log;
use crate::provider::Provider;
use crate::retry::Cancel;

/// Returns the provider's collaborator check. Fails closed: any provider
/// error is treated as "not authorized" rather than propagated, since a
/// security check that can silently pass on error is worse than one that's
/// occasionally too strict.
pub fn is_authorized(provider: &dyn Provider, cancel: &Cancel, repo: &str, user: &str) -> bool {
    match provider.is_collaborator(cancel, repo, user) {
        Ok(true) => true,
        Ok(false) => {
            log::info(repo, &format!("{user} is not a collaborator; ignoring their input"));
            false
        }
        Err(e) => {
            log::warn(repo, &format!("collaborator check failed for {user}, failing closed: {e}"));
            false
        }
    }
}
