//! Batches: the unit of persistence and of export

use crate::error::Result;
use crate::flatten::FlattenedVariantRecord;
use varidx_common::checksum::checksum_records;

/// An ordered run of at most `batch_size` records
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub seq: u64,
    pub records: Vec<FlattenedVariantRecord>,
}

impl Batch {
    pub fn new(seq: u64, records: Vec<FlattenedVariantRecord>) -> Self {
        Self { seq, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// SHA-256 over the records' JSON, one per line, in order
    pub fn checksum(&self) -> Result<String> {
        Ok(checksum_records(&self.records)?)
    }
}

/// What happened to a batch handed to the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Written { seq: u64, records: usize },
    /// Already present from an earlier run with the same checksum
    Resumed { seq: u64, records: usize },
}

impl BatchOutcome {
    pub fn seq(&self) -> u64 {
        match self {
            BatchOutcome::Written { seq, .. } | BatchOutcome::Resumed { seq, .. } => *seq,
        }
    }
}

/// Cuts a record stream into consecutive batches of `batch_size`
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    next_seq: u64,
    pending: Vec<FlattenedVariantRecord>,
}

impl Batcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            next_seq: 0,
            pending: Vec::with_capacity(batch_size),
        }
    }

    /// Returns a full batch once `batch_size` records have accumulated
    pub fn push(&mut self, record: FlattenedVariantRecord) -> Option<Batch> {
        self.pending.push(record);
        if self.pending.len() >= self.batch_size {
            Some(self.cut())
        } else {
            None
        }
    }

    /// The final, possibly short, batch
    pub fn finish(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.cut())
        }
    }

    /// Drop records that never made a full batch; returns how many
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Sequence number the next batch will get
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    fn cut(&mut self) -> Batch {
        let records = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        let batch = Batch::new(self.next_seq, records);
        self.next_seq += 1;
        batch
    }
}

#[cfg(test)]
pub(crate) mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::flatten::VariantFlattener;
    use crate::nirvana::model::PositionEntry;
    use proptest::prelude::*;
    use serde_json::json;

    /// A minimal valid record at `position`
    pub(crate) fn sample_record(position: i64) -> FlattenedVariantRecord {
        let entry: PositionEntry = serde_json::from_value(json!({
            "chromosome": "chr1",
            "position": position,
            "refAllele": "A",
            "altAlleles": ["G"],
            "variants": [{
                "transcripts": [{"hgnc": "GENE1", "consequence": ["missense_variant"], "transcript": "ENST1"}],
                "gnomad": {"allAf": 0.01, "allAc": 3, "failedFilter": false},
                "phylopScore": -1.25
            }]
        }))
        .unwrap();
        let unit = entry.into_units(position as u64).remove(0);
        VariantFlattener::new().flatten(&unit).unwrap()
    }

    #[test]
    fn test_2500_records_make_three_batches() {
        let mut batcher = Batcher::new(1000);
        let mut sizes = Vec::new();
        for i in 0..2500 {
            if let Some(batch) = batcher.push(sample_record(i)) {
                sizes.push((batch.seq, batch.len()));
            }
        }
        if let Some(batch) = batcher.finish() {
            sizes.push((batch.seq, batch.len()));
        }
        assert_eq!(sizes, vec![(0, 1000), (1, 1000), (2, 500)]);
    }

    #[test]
    fn test_discard_drops_partial_batch() {
        let mut batcher = Batcher::new(10);
        for i in 0..3 {
            assert!(batcher.push(sample_record(i)).is_none());
        }
        assert_eq!(batcher.discard(), 3);
        assert!(batcher.finish().is_none());
    }

    #[test]
    fn test_checksum_is_content_sensitive() {
        let a = Batch::new(0, vec![sample_record(1), sample_record(2)]);
        let b = Batch::new(0, vec![sample_record(2), sample_record(1)]);
        assert_eq!(a.checksum().unwrap(), a.clone().checksum().unwrap());
        assert_ne!(a.checksum().unwrap(), b.checksum().unwrap());
    }

    proptest! {
        #[test]
        fn prop_only_last_batch_is_short(count in 0usize..120, batch_size in 1usize..64) {
            let mut batcher = Batcher::new(batch_size);
            let mut batches = Vec::new();
            for i in 0..count {
                batches.extend(batcher.push(sample_record(i as i64)));
            }
            batches.extend(batcher.finish());

            prop_assert_eq!(batches.iter().map(Batch::len).sum::<usize>(), count);
            for (i, batch) in batches.iter().enumerate() {
                prop_assert_eq!(batch.seq, i as u64);
                prop_assert!(batch.len() <= batch_size);
                if i + 1 < batches.len() {
                    prop_assert_eq!(batch.len(), batch_size);
                }
            }
        }
    }
}
