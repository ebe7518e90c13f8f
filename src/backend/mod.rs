///
/// etcd v3 implementation of [`crate::store::VersionedStore`].
///
pub mod etcd;

///
/// In-process implementation of [`crate::store::VersionedStore`].
///
pub mod memory;

pub use {etcd::EtcdStore, memory::MemoryStore};
