//! Fleet kubehub: discovery, the type index and list/watch sources.

#![forbid(unsafe_code)]

pub mod discovery;
pub mod fake;
pub mod index;
pub mod kube_source;
pub mod source;

pub use discovery::{discover, with_deadline, Discovered};
pub use fake::{FakeCluster, FakeConnector};
pub use index::TypeIndex;
pub use kube_source::{KubeConnector, KubeSource};
pub use source::{ClusterSource, Connector, EventStream, SourceError};
