use bitflags::bitflags;

bitflags! {
    /// Event classes a client can subscribe to with the `idle` verb.
    ///
    /// Bit positions are fixed: notification lines are emitted in ascending
    /// bit order, which is the wire order clients observe.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IdleEvents: u32 {
        const DATABASE = 1 << 0;
        const STORED_PLAYLIST = 1 << 1;
        const PLAYLIST = 1 << 2;
        const PLAYER = 1 << 3;
        const MIXER = 1 << 4;
        const OUTPUT = 1 << 5;
        const OPTIONS = 1 << 6;
        const UPDATE = 1 << 7;
    }
}

/// Wire names indexed by bit position.
const NAMES: [(IdleEvents, &str); 8] = [
    (IdleEvents::DATABASE, "database"),
    (IdleEvents::STORED_PLAYLIST, "stored_playlist"),
    (IdleEvents::PLAYLIST, "playlist"),
    (IdleEvents::PLAYER, "player"),
    (IdleEvents::MIXER, "mixer"),
    (IdleEvents::OUTPUT, "output"),
    (IdleEvents::OPTIONS, "options"),
    (IdleEvents::UPDATE, "update"),
];

impl IdleEvents {
    /// Looks up a single event class by its wire name.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        NAMES.iter().find(|(_, n)| *n == name).map(|(ev, _)| *ev)
    }

    /// The wire names of every set bit, in canonical (bit) order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        NAMES.into_iter().filter_map(move |(ev, name)| self.contains(ev).then_some(name))
    }
}
