//! Seam over the git-checkout-and-restart mechanics.

/// Performs the actual commit switch on the local checkout. The real
/// implementation shells out to the launch scripts, which are outside
/// the core; nodes receiving an UPGRADE_REQUEST drive this and then
/// restart themselves.
pub trait CommitSwitcher: Send + Sync + 'static {
    /// The commit the node currently runs.
    fn current_commit(&self) -> Result<String, String>;

    /// Moves the checkout to `commit`. The restart happens after.
    fn switch(&self, commit: &str) -> Result<(), String>;
}

/// Switcher stub for tests and nodes without upgrade duty.
pub struct NullSwitcher {
    commit: parking_lot::Mutex<String>,
}

impl NullSwitcher {
    /// Creates a stub reporting the given current commit.
    #[must_use]
    pub fn new(commit: impl Into<String>) -> Self {
        Self {
            commit: parking_lot::Mutex::new(commit.into()),
        }
    }
}

impl CommitSwitcher for NullSwitcher {
    fn current_commit(&self) -> Result<String, String> {
        Ok(self.commit.lock().clone())
    }

    fn switch(&self, commit: &str) -> Result<(), String> {
        *self.commit.lock() = commit.to_string();
        Ok(())
    }
}
