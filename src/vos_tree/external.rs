//! Named external collaborator types (§1 "deliberately out of scope"):
//! the RPC transport, pool membership/placement, fabric configuration,
//! cluster management client, telemetry sinks, and checksum/erasure
//! libraries the object layer would hand bytes to or receive bytes from.
//!
//! These are marker traits only — the object/key layer (§4.H) references
//! them by name where it would hand off, but no method is called through
//! them anywhere in this crate. Implementing any of them is out of scope
//! per §1's Non-goals; they exist so the hand-off points in [`super`] are
//! typed rather than left as untyped comments.

/// The RPC transport that would carry a container's requests between
/// engines. §6 names the relevant methods (`PoolConnect`, `PoolMonitor`,
/// ...) without specifying wire framing, which this crate does not own.
pub trait RpcTransport {}

/// Pool membership and placement: which targets hold which shards of a
/// container's objects. The object layer consults this to decide which
/// DTX participants to contact, but never instantiates one itself.
pub trait PlacementService {}

/// The cluster management client (engine join/leave, rank assignment).
pub trait ClusterManagementClient {}

/// A telemetry sink receiving the stats snapshots this crate's
/// `*Stats` types expose (see `SPEC_FULL.md` §A.4/B) without owning how
/// they are shipped off-box.
pub trait TelemetrySink {}

/// Checksum/erasure-coding library used above this layer for redundancy
/// groups; the extent tree only stores the `csum` field it is handed.
pub trait ErasureCodec {}
