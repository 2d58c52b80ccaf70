use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::index::KeyComparator;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, BPlusTreePageType, RecordId,
};

const INTERNAL_PAGE_TYPE: u32 = 1;
const LEAF_PAGE_TYPE: u32 = 2;

// The log manager is a stub; nodes carry the LSN slot for layout
// compatibility and always persist zero.
const STUB_LSN: u32 = 0;

pub struct RecordIdCodec;

impl RecordIdCodec {
    pub fn encode(rid: &RecordId) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend(CommonCodec::encode_i32(rid.page_id));
        bytes.extend(CommonCodec::encode_u32(rid.slot));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<RecordId>> {
        let (page_id, offset1) = CommonCodec::decode_i32(bytes)?;
        let (slot, offset2) = CommonCodec::decode_u32(&bytes[offset1..])?;
        Ok((RecordId::new(page_id, slot), offset1 + offset2))
    }
}

struct BPlusTreePageTypeCodec;

impl BPlusTreePageTypeCodec {
    fn encode(page_type: BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::InternalPage => CommonCodec::encode_u32(INTERNAL_PAGE_TYPE),
            BPlusTreePageType::LeafPage => CommonCodec::encode_u32(LEAF_PAGE_TYPE),
        }
    }

    fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreePageType>> {
        let (tag, offset) = CommonCodec::decode_u32(bytes)?;
        match tag {
            INTERNAL_PAGE_TYPE => Ok((BPlusTreePageType::InternalPage, offset)),
            LEAF_PAGE_TYPE => Ok((BPlusTreePageType::LeafPage, offset)),
            other => Err(VellumError::Storage(format!(
                "unknown b+tree page type {}",
                other
            ))),
        }
    }
}

/**
 * Shared node header (24 bytes):
 * ------------------------------------------------------------------------------------
 * | PageType (4) | Lsn (4) | Size (4) | MaxSize (4) | ParentPageId (4) | PageId (4) |
 * ------------------------------------------------------------------------------------
 * Leaf nodes append NextPageId (4). The slotted (key, value) array follows.
 */
pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage) -> Vec<u8> {
        match page {
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page),
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page),
        }
    }

    pub fn decode(
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> VellumResult<DecodedData<BPlusTreePage>> {
        let (page_type, _) = BPlusTreePageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::InternalPage => {
                let (page, offset) = BPlusTreeInternalPageCodec::decode(bytes, comparator)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes, comparator)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
        }
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode(page: &BPlusTreeInternalPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreePageTypeCodec::encode(
            BPlusTreePageType::InternalPage,
        ));
        bytes.extend(CommonCodec::encode_u32(STUB_LSN));
        bytes.extend(CommonCodec::encode_i32(page.size() as i32));
        bytes.extend(CommonCodec::encode_i32(page.max_size as i32));
        bytes.extend(CommonCodec::encode_i32(page.parent_page_id));
        bytes.extend(CommonCodec::encode_i32(page.page_id));
        for (key, child) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(CommonCodec::encode_i32(*child));
        }
        assert!(
            bytes.len() <= PAGE_SIZE,
            "internal node overflows the page: {} bytes",
            bytes.len()
        );
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> VellumResult<DecodedData<BPlusTreeInternalPage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(VellumError::Storage(format!(
                "index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if page_type != BPlusTreePageType::InternalPage {
            return Err(VellumError::Storage(
                "page type must be internal".to_string(),
            ));
        }
        left_bytes = &left_bytes[offset..];

        let (_lsn, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (size, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (parent_page_id, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (page_id, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let (key, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (child, offset) = CommonCodec::decode_i32(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, child as PageId));
        }

        let mut page =
            BPlusTreeInternalPage::new(page_id, parent_page_id, max_size as u32, comparator);
        page.array = array;
        Ok((page, PAGE_SIZE))
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode(page: &BPlusTreeLeafPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PAGE_SIZE);
        bytes.extend(BPlusTreePageTypeCodec::encode(BPlusTreePageType::LeafPage));
        bytes.extend(CommonCodec::encode_u32(STUB_LSN));
        bytes.extend(CommonCodec::encode_i32(page.size() as i32));
        bytes.extend(CommonCodec::encode_i32(page.max_size as i32));
        bytes.extend(CommonCodec::encode_i32(page.parent_page_id));
        bytes.extend(CommonCodec::encode_i32(page.page_id));
        bytes.extend(CommonCodec::encode_i32(page.next_page_id));
        for (key, rid) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(RecordIdCodec::encode(rid));
        }
        assert!(
            bytes.len() <= PAGE_SIZE,
            "leaf node overflows the page: {} bytes",
            bytes.len()
        );
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(
        bytes: &[u8],
        comparator: KeyComparator,
    ) -> VellumResult<DecodedData<BPlusTreeLeafPage>> {
        if bytes.len() != PAGE_SIZE {
            return Err(VellumError::Storage(format!(
                "index page size is {} instead of {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }
        let mut left_bytes = bytes;

        let (page_type, offset) = BPlusTreePageTypeCodec::decode(left_bytes)?;
        if page_type != BPlusTreePageType::LeafPage {
            return Err(VellumError::Storage("page type must be leaf".to_string()));
        }
        left_bytes = &left_bytes[offset..];

        let (_lsn, offset) = CommonCodec::decode_u32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (size, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (max_size, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (parent_page_id, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (page_id, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];
        let (next_page_id, offset) = CommonCodec::decode_i32(left_bytes)?;
        left_bytes = &left_bytes[offset..];

        let mut array = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let (key, offset) = CommonCodec::decode_bytes(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            let (rid, offset) = RecordIdCodec::decode(left_bytes)?;
            left_bytes = &left_bytes[offset..];
            array.push((key, rid));
        }

        let mut page = BPlusTreeLeafPage::new(page_id, parent_page_id, max_size as u32, comparator);
        page.next_page_id = next_page_id;
        page.array = array;
        Ok((page, PAGE_SIZE))
    }
}
