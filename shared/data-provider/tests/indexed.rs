use pretty_assertions::assert_eq;
use rkd_core::TokenSize;
use rkd_data_provider::{
    DistributedPartition, IndexedDataset, IndexedDatasetBuilder, IndexedDatasetError, LmCollator,
    TokenDataset,
};
use tempfile::tempdir;

#[test]
fn test_builder_and_reader_agree() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("train_0");

    let items = vec![
        vec![10, 11, 12, -1, 13, 14],
        vec![20, -1, 21],
        vec![30, 31, 32, 33],
    ];
    let mut builder = IndexedDatasetBuilder::new(&prefix, TokenSize::TwoBytes).unwrap();
    for item in &items {
        builder.add_item(item).unwrap();
    }
    assert_eq!(builder.len(), 3);
    let idx = builder.finalize().unwrap();
    assert!(idx.ends_with("train_0.idx"));

    let dataset = IndexedDataset::open(&prefix).unwrap();
    assert_eq!(dataset.len(), 3);
    assert_eq!(dataset.token_size(), TokenSize::TwoBytes);
    assert_eq!(dataset.item_len(0), Some(6));
    for (i, item) in items.iter().enumerate() {
        assert_eq!(&dataset.get(i).unwrap(), item);
    }

    // separator is stored as all ones
    let raw = std::fs::read(dir.path().join("train_0.bin")).unwrap();
    assert_eq!(&raw[6..8], &[0xff, 0xff]);
    assert_eq!(raw.len(), (6 + 3 + 4) * 2);
}

#[test]
fn test_out_of_range_and_overflow() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("dev_0");

    let mut builder = IndexedDatasetBuilder::new(&prefix, TokenSize::TwoBytes).unwrap();
    assert!(matches!(
        builder.add_item(&[65535]),
        Err(IndexedDatasetError::TokenOverflow { token: 65535, .. })
    ));
    assert!(matches!(
        builder.add_item(&[-2]),
        Err(IndexedDatasetError::TokenOverflow { token: -2, .. })
    ));
    builder.add_item(&[1, 2]).unwrap();
    builder.finalize().unwrap();

    let dataset = IndexedDataset::open(&prefix).unwrap();
    assert!(matches!(
        dataset.get(1),
        Err(IndexedDatasetError::IndexOutOfRange { index: 1, len: 1 })
    ));
    assert!(dataset.item(5).is_err());
}

#[test]
fn test_rejects_foreign_index() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("bogus");
    std::fs::write(dir.path().join("bogus.bin"), [0u8; 4]).unwrap();
    std::fs::write(dir.path().join("bogus.idx"), [7u8; 64]).unwrap();
    assert!(matches!(
        IndexedDataset::open(&prefix),
        Err(IndexedDatasetError::BadMagic(_))
    ));

    std::fs::write(dir.path().join("bogus.idx"), b"RKDIDX").unwrap();
    assert!(matches!(
        IndexedDataset::open(&prefix),
        Err(IndexedDatasetError::Truncated { .. })
    ));
}

#[test]
fn test_empty_dataset_opens() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("empty");
    IndexedDatasetBuilder::new(&prefix, TokenSize::FourBytes)
        .unwrap()
        .finalize()
        .unwrap();
    let dataset = IndexedDataset::open(&prefix).unwrap();
    assert!(dataset.is_empty());
}

#[test]
fn test_partitioned_batches_from_disk() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("valid_0");
    let mut builder = IndexedDatasetBuilder::new(&prefix, TokenSize::FourBytes).unwrap();
    for i in 0..5 {
        builder.add_item(&[100 + i, -1, 200 + i, 300 + i]).unwrap();
    }
    builder.finalize().unwrap();
    let dataset = IndexedDataset::open(&prefix).unwrap();

    let partition = DistributedPartition::new(1, 2);
    let collator = LmCollator::new(8, 0);
    let batches = partition.batches(dataset.len(), 4);
    assert_eq!(batches, vec![vec![1, 3]]);

    let items = dataset.items(&batches[0]).unwrap();
    let batch = collator.collate(&items).unwrap();
    assert_eq!(batch.input_ids, vec![vec![101, 201], vec![103, 203]]);
    assert_eq!(batch.label, vec![vec![201, 301], vec![203, 303]]);
    assert_eq!(batch.loss_mask, vec![vec![1.0, 1.0], vec![1.0, 1.0]]);
}

fn write_index_header(path: &std::path::Path, count: u64) {
    let mut header = b"RKDIDX\0\0".to_vec();
    header.extend_from_slice(&1u64.to_le_bytes());
    header.push(2);
    header.extend_from_slice(&count.to_le_bytes());
    std::fs::write(path, header).unwrap();
}

#[test]
fn test_huge_item_count_is_truncated_not_overflow() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("corrupt");
    std::fs::write(dir.path().join("corrupt.bin"), b"").unwrap();

    for count in [u64::MAX / 4, u64::MAX, 3] {
        write_index_header(&dir.path().join("corrupt.idx"), count);
        assert!(matches!(
            IndexedDataset::open(&prefix),
            Err(IndexedDatasetError::Truncated { .. })
        ));
    }
}

#[test]
fn test_item_offset_past_data_is_rejected() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("offsets");
    let idx = dir.path().join("offsets.idx");
    std::fs::write(dir.path().join("offsets.bin"), [0u8; 8]).unwrap();

    for (size, offset) in [(2u32, u64::MAX), (u32::MAX, 4), (4, 2)] {
        write_index_header(&idx, 1);
        let mut bytes = std::fs::read(&idx).unwrap();
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&offset.to_le_bytes());
        std::fs::write(&idx, bytes).unwrap();
        assert!(matches!(
            IndexedDataset::open(&prefix),
            Err(IndexedDatasetError::ItemOutOfBounds { index: 0, .. })
        ));
    }
}

#[test]
fn test_token_above_i32_range_is_corrupt() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("wide");
    let mut builder = IndexedDatasetBuilder::new(&prefix, TokenSize::FourBytes).unwrap();
    builder.add_item(&[1, -1, 2]).unwrap();
    builder.finalize().unwrap();

    let bin = dir.path().join("wide.bin");
    let mut raw = std::fs::read(&bin).unwrap();
    raw[8..12].copy_from_slice(&0x8000_0000u32.to_le_bytes());
    std::fs::write(&bin, raw).unwrap();

    let dataset = IndexedDataset::open(&prefix).unwrap();
    assert!(matches!(
        dataset.get(0),
        Err(IndexedDatasetError::CorruptToken {
            index: 0,
            value: 0x8000_0000
        })
    ));
}
