pub(crate) mod online_watcher;
pub(crate) mod queue_drainer;
pub(crate) mod store_loop;
