use crate::error::{VellumError, VellumResult};
use crate::storage::codec::DecodedData;

/// Fixed-width big-endian scalar encoding shared by every page codec.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> VellumResult<DecodedData<u32>> {
        if bytes.len() < 4 {
            return Err(VellumError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_be_bytes(data), 4))
    }

    pub fn encode_i32(data: i32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i32(bytes: &[u8]) -> VellumResult<DecodedData<i32>> {
        if bytes.len() < 4 {
            return Err(VellumError::Internal(format!(
                "bytes length {} is less than 4",
                bytes.len()
            )));
        }
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((i32::from_be_bytes(data), 4))
    }

    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + data.len());
        bytes.extend(Self::encode_u32(data.len() as u32));
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> VellumResult<DecodedData<Vec<u8>>> {
        let (length, offset) = Self::decode_u32(bytes)?;
        let length = length as usize;
        if bytes.len() < offset + length {
            return Err(VellumError::Internal(format!(
                "bytes length {} is less than expected {}",
                bytes.len(),
                offset + length
            )));
        }
        Ok((bytes[offset..offset + length].to_vec(), offset + length))
    }
}
