//! `ProcessHub` Core -- registry data model, distribution strategies, and wire schemas.
//!
//! This crate provides the runtime-independent foundation of the hub:
//!
//! - **Hash** ([`hash`]): 64-bit FNV-1a for ring point placement
//! - **Clock** ([`clock`]): `ClockSource` abstraction for contribution timestamps
//! - **Types** ([`types`]): `ChildSpec`, `Pid`, `RedundancyMode`, `StartResult`
//! - **Registry** ([`registry`]): per-node-asserted child → locations map with
//!   timestamp-guarded merge rules
//! - **Ring** ([`ring`]): consistent-hash ring and the alternative distribution
//!   strategies behind one pure `belongs_to` contract
//! - **Redundancy** ([`redundancy`]): active/passive replica mode selection
//! - **Messages** ([`messages`]): inter-node wire schema (named MsgPack)

pub mod clock;
pub mod hash;
pub mod messages;
pub mod redundancy;
pub mod registry;
pub mod ring;
pub mod types;

// Clock
pub use clock::{ClockSource, ManualClock, SystemClock};

// Hash
pub use hash::{fnv1a_64, fnv1a_str};

// Types
pub use types::{ChildSpec, Pid, RedundancyMode, StartResult};

// Registry
pub use registry::{
    ChildRecord, HubRegistry, NodeContribution, RegistryChange, RegistryEntry, RegistrySnapshot,
};

// Ring
pub use ring::{DistributionKind, DistributionStrategy, HashRing, VNODES};

// Redundancy
pub use redundancy::select_modes;

// Messages
pub use messages::{
    decode_envelope, encode_envelope, ChildEdge, ChildStartRespPayload, Envelope,
    HandoverShipPayload, HubMessage, PropagateOp, PropagatePayload, ShippedState,
    StartChildReqPayload, SyncPayload, TerminateChildPayload,
};
