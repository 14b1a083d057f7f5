use std::fmt;

/// Mask selecting the verb id from the wire verb byte.
pub const VERB_MASK: u8 = 0x1f;

/// Flag bit on the wire verb byte indicating an LZ4-compressed payload.
pub const VERB_FLAG_COMPRESSED: u8 = 0x80;

/// Message verbs. The low five bits of a packet's verb byte select one of
/// these; the remaining bits are flags.
///
/// Transport-layer verbs are handled by the VL1 core itself; the virtual
/// Ethernet verbs ([`Verb::is_vl2`]) are delegated upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Nop,
    Hello,
    Error,
    Ok,
    Whois,
    Rendezvous,
    Frame,
    ExtFrame,
    Echo,
    MulticastLike,
    NetworkCredentials,
    NetworkConfigRequest,
    NetworkConfig,
    MulticastGather,
    PushDirectPaths,
    UserMessage,
    Multicast,
    Encap,
    Unknown(u8),
}

impl Verb {
    /// Decode from a wire verb byte, ignoring flag bits.
    pub fn from_wire(byte: u8) -> Self {
        match byte & VERB_MASK {
            0 => Verb::Nop,
            1 => Verb::Hello,
            2 => Verb::Error,
            3 => Verb::Ok,
            4 => Verb::Whois,
            5 => Verb::Rendezvous,
            6 => Verb::Frame,
            7 => Verb::ExtFrame,
            8 => Verb::Echo,
            9 => Verb::MulticastLike,
            10 => Verb::NetworkCredentials,
            11 => Verb::NetworkConfigRequest,
            12 => Verb::NetworkConfig,
            13 => Verb::MulticastGather,
            16 => Verb::PushDirectPaths,
            20 => Verb::UserMessage,
            22 => Verb::Multicast,
            23 => Verb::Encap,
            other => Verb::Unknown(other),
        }
    }

    /// The wire id of this verb.
    pub fn code(self) -> u8 {
        match self {
            Verb::Nop => 0,
            Verb::Hello => 1,
            Verb::Error => 2,
            Verb::Ok => 3,
            Verb::Whois => 4,
            Verb::Rendezvous => 5,
            Verb::Frame => 6,
            Verb::ExtFrame => 7,
            Verb::Echo => 8,
            Verb::MulticastLike => 9,
            Verb::NetworkCredentials => 10,
            Verb::NetworkConfigRequest => 11,
            Verb::NetworkConfig => 12,
            Verb::MulticastGather => 13,
            Verb::PushDirectPaths => 16,
            Verb::UserMessage => 20,
            Verb::Multicast => 22,
            Verb::Encap => 23,
            Verb::Unknown(code) => code & VERB_MASK,
        }
    }

    /// True for verbs that belong to the virtual Ethernet layer.
    pub fn is_vl2(self) -> bool {
        matches!(
            self,
            Verb::Frame
                | Verb::ExtFrame
                | Verb::MulticastLike
                | Verb::NetworkCredentials
                | Verb::NetworkConfigRequest
                | Verb::NetworkConfig
                | Verb::MulticastGather
                | Verb::Multicast
        )
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Unknown(code) => write!(f, "UNKNOWN({code})"),
            other => {
                let name = match other {
                    Verb::Nop => "NOP",
                    Verb::Hello => "HELLO",
                    Verb::Error => "ERROR",
                    Verb::Ok => "OK",
                    Verb::Whois => "WHOIS",
                    Verb::Rendezvous => "RENDEZVOUS",
                    Verb::Frame => "FRAME",
                    Verb::ExtFrame => "EXT_FRAME",
                    Verb::Echo => "ECHO",
                    Verb::MulticastLike => "MULTICAST_LIKE",
                    Verb::NetworkCredentials => "NETWORK_CREDENTIALS",
                    Verb::NetworkConfigRequest => "NETWORK_CONFIG_REQUEST",
                    Verb::NetworkConfig => "NETWORK_CONFIG",
                    Verb::MulticastGather => "MULTICAST_GATHER",
                    Verb::PushDirectPaths => "PUSH_DIRECT_PATHS",
                    Verb::UserMessage => "USER_MESSAGE",
                    Verb::Multicast => "MULTICAST",
                    Verb::Encap => "ENCAP",
                    Verb::Unknown(_) => unreachable!(),
                };
                f.write_str(name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_ignores_flags() {
        for code in 0u8..32 {
            let verb = Verb::from_wire(code | VERB_FLAG_COMPRESSED);
            assert_eq!(verb.code(), code);
        }
    }

    #[test]
    fn vl2_classification() {
        assert!(Verb::Frame.is_vl2());
        assert!(Verb::MulticastGather.is_vl2());
        assert!(!Verb::Hello.is_vl2());
        assert!(!Verb::Echo.is_vl2());
        assert!(!Verb::Unknown(31).is_vl2());
    }
}
