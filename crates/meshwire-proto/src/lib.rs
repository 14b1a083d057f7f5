//! Wire-format primitives for the Meshwire VL1 transport.
//!
//! This crate holds everything below the crypto and dispatch layers: packet
//! and fragment header layouts, the 40-bit address type, the pooled packet
//! buffers shared across the ingress pipeline, and the defragmenter that
//! reassembles multi-datagram packets arriving out of order.

pub mod address;
pub mod buf;
pub mod defrag;
pub mod dictionary;
pub mod endpoint;
pub mod verb;
pub mod wire;

pub use address::{Address, ADDRESS_LENGTH};
pub use buf::{Buf, BufPool, Slice, SliceError, SliceVector, BUF_CAPACITY, BUF_HEADROOM};
pub use defrag::{Assembled, DefragError, Defragmenter, FRAGMENT_TTL_MS, MAX_ASSEMBLIES};
pub use dictionary::{Dictionary, DictionaryError};
pub use endpoint::{decode_endpoint, encode_endpoint};
pub use verb::{Verb, VERB_FLAG_COMPRESSED, VERB_MASK};
pub use wire::{
    fragment_packet, next_packet_id, write_header, FragmentHeader, PacketHeader, WireError,
    ENCRYPTED_SECTION_START, FLAG_FRAGMENTED, FRAGMENT_HEADER_SIZE, FRAGMENT_INDICATOR,
    FRAGMENT_INDICATOR_INDEX, HEADER_SIZE, MAX_FRAGMENTS, MAX_HOPS,
    MAX_INCOMING_FRAGMENTS_PER_PATH, MAX_PACKET_LENGTH, MIN_FRAGMENT_LENGTH, MIN_PACKET_LENGTH,
    PAYLOAD_START,
};
