use crate::cgroup::BoxCgroup;
use std::path::PathBuf;

/// A completed setup step and how to take it back.
#[derive(Debug)]
pub enum Undo {
    RemoveDir(PathBuf),
    RemoveCgroup(BoxCgroup),
    Unmount(PathBuf),
}

/// Records host-side setup as it succeeds. Dropping an uncommitted ledger
/// tears down exactly the recorded steps, newest first.
#[derive(Debug, Default)]
pub struct SetupLedger {
    steps: Vec<Undo>,
    committed: bool,
}

impl SetupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, undo: Undo) {
        self.steps.push(undo);
    }

    /// Setup finished; ownership of the resources moves to the caller.
    pub fn commit(mut self) {
        self.committed = true;
    }

    fn rollback(&mut self) {
        let mut mount_leaked = false;
        while let Some(step) = self.steps.pop() {
            let result = match &step {
                // Never recurse into a tree that may still have a bind mount in it
                Undo::RemoveDir(path) if mount_leaked => {
                    tracing::warn!(path = %path.display(), "leaving directory with leaked mount");
                    Ok(())
                }
                Undo::RemoveDir(path) => match std::fs::remove_dir_all(path) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    other => other,
                },
                Undo::RemoveCgroup(cgroup) => cgroup.remove(),
                Undo::Unmount(path) => crate::isolation::detach(path),
            };
            if let Err(e) = result {
                mount_leaked |= matches!(step, Undo::Unmount(_));
                tracing::warn!(step = ?step, error = %e, "setup rollback step failed");
            }
        }
    }
}

impl Drop for SetupLedger {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}
