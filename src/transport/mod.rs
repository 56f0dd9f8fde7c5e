//! Transport layer: segmentation and reassembly of diagnostic messages over
//! classic CAN frames per ISO 15765-2.

pub mod cantp;

pub use cantp::{
    decode_can_id, encode_can_id, CanTp, CanTpConfig, CanTpState, CanTpTiming, TpMessage,
    SINGLE_FRAME_MAX_LEN,
};
