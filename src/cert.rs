//! Gateway certificates: the identity and capability set the MS vouches for,
//! and the public key manifests are verified against.

use ed25519_dalek::VerifyingKey;

use crate::ids::GatewayId;

/// A capability an MS-issued certificate may grant. Only `COORDINATE` gates
/// behavior in this crate today, in the coordinator handoff; the rest round
/// out the set an MS certificate actually carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    /// May become the coordinator of a file via the MS `coordinate` RPC.
    Coordinate,
    /// May read block content from this gateway.
    Read,
    /// May write block content to this gateway.
    Write,
}

/// The MS's signed statement of who a gateway is and what it may do.
#[derive(Debug, Clone)]
pub struct GatewayCert {
    pub gateway_id: GatewayId,
    pub public_key: VerifyingKey,
    pub capabilities: Vec<Capability>,
}

impl GatewayCert {
    pub fn new(gateway_id: GatewayId, public_key: VerifyingKey, capabilities: Vec<Capability>) -> Self {
        GatewayCert {
            gateway_id,
            public_key,
            capabilities,
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    pub fn can_coordinate(&self) -> bool {
        self.has(Capability::Coordinate)
    }
}
