use bytes::{Buf, BufMut, Bytes, BytesMut};
use hopswitch_core::{ChannelId, ForwardingInstruction, IncomingHtlc, NextHop};

use crate::error::DecodeError;
use crate::traits::OnionDecoder;

const TAG_EXIT: u8 = 0;
const TAG_FORWARD: u8 = 1;

/// tag (1) | next channel (8) | amount msat (8) | outgoing cltv (4)
const HEADER_LEN: usize = 21;

/// Unencrypted hop payload codec.
///
/// Each onion is one fixed header followed by the payload for the next hop,
/// all integers big-endian. No cryptography is involved.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearTextDecoder;

impl ClearTextDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Build the onion a [`ClearTextDecoder`] turns back into `instruction`.
    pub fn encode(instruction: &ForwardingInstruction) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + instruction.payload.len());
        match instruction.next_hop {
            NextHop::Exit => {
                buf.put_u8(TAG_EXIT);
                buf.put_u64(0);
            }
            NextHop::Channel(chan) => {
                buf.put_u8(TAG_FORWARD);
                buf.put_u64(chan.as_u64());
            }
        }
        buf.put_u64(instruction.amount_to_forward_msat);
        buf.put_u32(instruction.outgoing_cltv);
        buf.put_slice(&instruction.payload);
        buf.freeze()
    }
}

impl OnionDecoder for ClearTextDecoder {
    fn decode(&self, htlc: &IncomingHtlc) -> Result<ForwardingInstruction, DecodeError> {
        let mut buf = htlc.onion.clone();
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }

        let tag = buf.get_u8();
        let chan = buf.get_u64();
        let next_hop = match tag {
            TAG_EXIT => NextHop::Exit,
            TAG_FORWARD => NextHop::Channel(ChannelId(chan)),
            other => return Err(DecodeError::UnknownTag(other)),
        };
        let amount_to_forward_msat = buf.get_u64();
        let outgoing_cltv = buf.get_u32();

        Ok(ForwardingInstruction {
            next_hop,
            amount_to_forward_msat,
            outgoing_cltv,
            payload: buf,
        })
    }
}
