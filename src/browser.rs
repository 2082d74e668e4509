//! The automated-browser boundary: an opaque handle plus the trait the
//! session manager drives it through. Nothing in this crate knows which
//! automation library or browser binary is actually behind it.

use async_trait::async_trait;

use crate::error::Result;

/// A running browser instance pointed at one display.
#[async_trait]
pub trait Browser: Send + Sync {
	/// Closes the browser. Idempotent; called during rollback and teardown,
	/// so it must tolerate being invoked on an already-closed browser.
	async fn close(&mut self) -> Result<()>;
}

/// The automation handle used to drive a browser (navigate, wait for
/// readiness). Kept separate from [`Browser`] because some automation
/// libraries model the driver connection and the browser process as
/// distinct resources with independent lifetimes.
#[async_trait]
pub trait Automation: Send + Sync {
	/// Stops the automation session. Idempotent, same contract as
	/// [`Browser::close`].
	async fn stop(&mut self) -> Result<()>;
}

/// Obtains an `(Automation, Browser)` pair pointed at a URL on a given
/// display. Implementations decide what "ready" means (DOM content loaded,
/// a selector present, a fixed delay); a failed navigation must leave no
/// process behind for the caller to clean up.
#[async_trait]
pub trait Launcher: Send + Sync {
	async fn launch(&self, display: &str, url: &str, width: u32, height: u32) -> Result<(Box<dyn Automation>, Box<dyn Browser>)>;
}
