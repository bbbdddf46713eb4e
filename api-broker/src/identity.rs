//! Client connection identifiers.
//!
//! Every peer connected to the front-end socket is named by a fixed-width
//! identifier. Lanes that push asynchronous messages (transaction callbacks,
//! contract events) address peers by this identifier, either captured when the
//! request arrived or derived from a subscription id.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Width of a client identifier on the wire.
pub const CLIENT_ID_LEN: usize = 5;

/// Opaque identifier of one connected peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId([u8; CLIENT_ID_LEN]);

/// Returned when a frame that should carry a [`ClientId`] has the wrong length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("client identifier must be {CLIENT_ID_LEN} bytes, got {0}")]
pub struct InvalidClientId(pub usize);

impl ClientId {
    pub const fn new(bytes: [u8; CLIENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derives the identifier a subscription pushes to.
    ///
    /// The id is laid out as a big-endian `u64` and its low five bytes become
    /// the identifier. Higher bytes are discarded.
    pub fn from_subscription_id(id: u64) -> Self {
        let wide = id.to_be_bytes();
        let mut bytes = [0u8; CLIENT_ID_LEN];
        bytes.copy_from_slice(&wide[8 - CLIENT_ID_LEN..]);
        Self(bytes)
    }

    /// Inverse of [`ClientId::from_subscription_id`] for ids that fit in five bytes.
    ///
    /// Handlers use this to key subscriptions by the connection that created them.
    pub fn subscription_id(&self) -> u64 {
        let mut wide = [0u8; 8];
        wide[8 - CLIENT_ID_LEN..].copy_from_slice(&self.0);
        u64::from_be_bytes(wide)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }
}

impl TryFrom<&[u8]> for ClientId {
    type Error = InvalidClientId;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; CLIENT_ID_LEN] = value
            .try_into()
            .map_err(|_| InvalidClientId(value.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_id_keeps_low_five_bytes() {
        let id = ClientId::from_subscription_id(0xAA);
        assert_eq!(id.as_bytes(), &[0, 0, 0, 0, 0xAA]);

        let id = ClientId::from_subscription_id(0x1122_3344_5566_7788);
        assert_eq!(id.as_bytes(), &[0x44, 0x55, 0x66, 0x77, 0x88]);
    }

    #[test]
    fn subscription_id_round_trips_within_five_bytes() {
        let id = ClientId::new([0x00, 0x12, 0x34, 0x56, 0x78]);
        assert_eq!(id.subscription_id(), 0x12_3456_78);
        assert_eq!(ClientId::from_subscription_id(id.subscription_id()), id);
    }

    #[test]
    fn rejects_wrong_lengths() {
        assert_eq!(ClientId::try_from(&[][..]), Err(InvalidClientId(0)));
        assert_eq!(ClientId::try_from(&[1, 2, 3, 4][..]), Err(InvalidClientId(4)));
        assert_eq!(
            ClientId::try_from(&[1, 2, 3, 4, 5, 6][..]),
            Err(InvalidClientId(6))
        );
        assert!(ClientId::try_from(&[1, 2, 3, 4, 5][..]).is_ok());
    }

    #[test]
    fn displays_as_hex() {
        let id = ClientId::new([0, 0, 0, 0, 0xff]);
        assert_eq!(id.to_string(), "0x00000000ff");
        assert_eq!(format!("{id:?}"), "ClientId(0x00000000ff)");
    }
}
