//! Metadata engine library: namespace store, quota/trash/snapshot machinery,
//! changelog + image persistence with crash recovery, and the command
//! dispatcher gluing them to the RPC and replication layers.

pub mod attr;
pub mod buckets;
pub mod changelog;
pub mod chunks;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod fs;
pub mod hashtab;
pub mod hooks;
pub mod idalloc;
pub mod node;
pub mod quota;
pub mod replication;
pub mod restore;
pub mod snapshot;
pub mod store;
pub mod trash;
pub mod utils;
pub mod wire;

pub use config::{AtimeMode, FsConfig, MetaConfig};
pub use dispatcher::{Master, NullReplicator, Replicator};
pub use errors::{FsResult, MfsError, STATUS_OK};
pub use fs::FsState;
pub use hooks::Hooks;
pub use node::{NodeType, StatsRecord, ROOT_INODE};

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::changelog::ChangelogSink;
    use super::config::FsConfig;
    use super::dispatcher::Master;
    use super::fs::FsState;
    use super::hooks::Hooks;

    pub fn new_fs() -> FsState {
        let mut fs = FsState::new(FsConfig::default(), Hooks::default());
        fs.fs_new(1);
        fs
    }

    pub fn new_master() -> Master {
        let mut m = Master::new(new_fs());
        m.metaversion = 1;
        m.metaid = 0x1122334455667788;
        m
    }

    /// A master with no filesystem yet - the image loader builds everything.
    pub fn empty_master() -> Master {
        Master::new(FsState::new(FsConfig::default(), Hooks::default()))
    }

    /// Changelog sink the test keeps a handle on.
    #[derive(Clone, Default)]
    pub struct SharedLog(pub Rc<RefCell<Vec<(u64, String)>>>);

    impl ChangelogSink for SharedLog {
        fn append(&mut self, version: u64, data: &str) {
            self.0.borrow_mut().push((version, data.to_string()));
        }
    }

    pub fn new_logged_master() -> (Master, SharedLog) {
        let mut m = new_master();
        let log = SharedLog::default();
        m.changelog = Box::new(log.clone());
        (m, log)
    }
}
