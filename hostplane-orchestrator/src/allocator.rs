use hostplane_common::OrchestratorError;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use uuid::Uuid;

use crate::store::PortRange;

/// QEMU's locally-administered OUI.
pub const MAC_PREFIX: [u8; 3] = [0x52, 0x54, 0x00];

const SECRET_LEN: usize = 24;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub uuid: Uuid,
    pub mac_address: String,
}

/// Fresh UUID + MAC. MAC collisions are not re-checked (24 random bits; the
/// store's unique constraint is the backstop).
pub fn allocate_identity() -> Identity {
    let mut rng = rand::thread_rng();
    let tail: [u8; 3] = rng.gen();
    Identity {
        uuid: Uuid::new_v4(),
        mac_address: format_mac(tail),
    }
}

pub fn format_mac(tail: [u8; 3]) -> String {
    let [a, b, c] = MAC_PREFIX;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        a, b, c, tail[0], tail[1], tail[2]
    )
}

/// Lowest port of `range` not in `used`.
///
/// Callers must hold the host-wide allocation lock (or the store's equivalent)
/// between reading `used` and persisting the result.
pub fn lowest_free_port<I>(used: I, range: PortRange) -> Result<u16, OrchestratorError>
where
    I: IntoIterator<Item = u16>,
{
    let used: HashSet<u16> = used.into_iter().collect();
    (range.min..=range.max)
        .find(|p| !used.contains(p))
        .ok_or(OrchestratorError::ResourceExhausted {
            min: range.min,
            max: range.max,
        })
}

/// Connection secret surfaced through the viewer file.
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}
