use std::{
    fmt,
    ops::{Index, IndexMut},
};

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    /// Packets protected with handshake keys
    Handshake = 1,
    /// Application data space, used for 0-RTT and post-handshake/1-RTT packets
    Data = 2,
}

impl SpaceId {
    /// All packet number spaces, in the order they are used during a connection
    pub const VALUES: [Self; 3] = [Self::Initial, Self::Handshake, Self::Data];

    /// Iterate over all packet number spaces
    pub fn iter() -> impl Iterator<Item = Self> {
        Self::VALUES.iter().copied()
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "initial",
            Self::Handshake => "handshake",
            Self::Data => "data",
        })
    }
}

/// One value of `T` for each packet number space
#[derive(Debug, Clone, Default)]
pub(crate) struct PerSpace<T>([T; 3]);

impl<T> PerSpace<T> {
    pub(crate) fn new(mut f: impl FnMut(SpaceId) -> T) -> Self {
        Self([
            f(SpaceId::Initial),
            f(SpaceId::Handshake),
            f(SpaceId::Data),
        ])
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SpaceId, &T)> {
        SpaceId::iter().zip(self.0.iter())
    }
}

impl<T> Index<SpaceId> for PerSpace<T> {
    type Output = T;
    fn index(&self, space: SpaceId) -> &T {
        &self.0[space as usize]
    }
}

impl<T> IndexMut<SpaceId> for PerSpace<T> {
    fn index_mut(&mut self, space: SpaceId) -> &mut T {
        &mut self.0[space as usize]
    }
}
