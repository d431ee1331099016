use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::LazyLock;
use std::sync::mpsc;
use std::thread;

use tracing::{debug, error};

use crate::ResourceList;

static COMMON: LazyLock<Cleaner> = LazyLock::new(Cleaner::background);

/// Runs the cleanup actions of scopes that were abandoned without being closed.
///
/// When the last reference to a scope (including every handle acquired from it) is dropped
/// while the scope is still alive, a scope created with a cleaner hands its pending
/// [`ResourceList`] to the cleaner. Scopes without a cleaner drop pending actions unrun.
///
/// Clones share the same underlying cleaner.
#[derive(Clone)]
pub struct Cleaner {
    mode: Mode,
}

#[derive(Clone)]
enum Mode {
    Inline,
    Background(mpsc::Sender<ResourceList>),
}

impl Cleaner {
    /// A cleaner that runs abandoned resource lists on the thread that drops the scope.
    #[must_use]
    pub fn inline() -> Self {
        Self { mode: Mode::Inline }
    }

    /// A cleaner that runs abandoned resource lists on a dedicated background thread.
    ///
    /// The thread exits once every clone of the cleaner has been dropped and every scope
    /// registered with it has been cleaned.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn the thread.
    #[must_use]
    pub fn background() -> Self {
        let (sender, receiver) = mpsc::channel::<ResourceList>();

        thread::Builder::new()
            .name("resource-scope-cleaner".to_string())
            .spawn(move || {
                debug!("cleaner thread started");

                for list in receiver {
                    run(&list);
                }

                debug!("cleaner thread exiting");
            })
            .expect("failed to spawn cleaner thread: thread spawning failure is not supported");

        Self {
            mode: Mode::Background(sender),
        }
    }

    /// The process-wide background cleaner, started on first use.
    #[must_use]
    pub fn common() -> Self {
        COMMON.clone()
    }

    /// Schedules the cleanup of an abandoned resource list.
    pub fn clean(&self, list: ResourceList) {
        match &self.mode {
            Mode::Inline => run(&list),
            Mode::Background(sender) => {
                if let Err(mpsc::SendError(list)) = sender.send(list) {
                    // The cleaner thread is gone, so there is nobody to delegate to.
                    run(&list);
                }
            }
        }
    }
}

fn run(list: &ResourceList) {
    match panic::catch_unwind(AssertUnwindSafe(|| list.cleanup())) {
        Ok(Ok(executed)) => debug!(executed, "cleaned abandoned scope"),
        // The scope was closed before it was abandoned; nothing left to do.
        Ok(Err(_)) => {}
        Err(_) => error!("cleanup action of abandoned scope panicked"),
    }
}

impl fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::Inline => "inline",
            Mode::Background(_) => "background",
        };

        f.debug_struct(type_name::<Self>())
            .field("mode", &mode)
            .finish()
    }
}
