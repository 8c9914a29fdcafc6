use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use arrow::array::Array;
use arrow::array::ArrayRef;
use arrow::array::BooleanArray;
use arrow::array::BooleanBuilder;
use arrow::array::Int32Array;
use arrow::array::Int32Builder;
use arrow::array::Int64Array;
use arrow::array::Int64Builder;
use arrow::array::Int8Array;
use arrow::array::Int8Builder;
use arrow::array::ListArray;
use arrow::array::ListBuilder;
use arrow::array::StringArray;
use arrow::array::StringBuilder;
use arrow::datatypes::DataType;
use arrow::datatypes::Field;
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::core::ChangeKind;
use crate::core::ChangeRow;
use crate::core::CommitRow;

/// Rows buffered per record batch. Writers flush and readers are handed
/// batches at this granularity, which is also a pipeline suspension point.
pub const BATCH_ROWS: usize = 10_000;

const TMP_EXTENSION: &str = "parquet.tmp";

fn commits_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("commit_oid", DataType::Utf8, false),
        Field::new("author_id", DataType::Int64, false),
        Field::new("author_ts", DataType::Int64, false),
        Field::new("committer_id", DataType::Int64, false),
        Field::new("committer_ts", DataType::Int64, false),
        Field::new("subject", DataType::Utf8, false),
        Field::new(
            "parent_oids",
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
            false,
        ),
        Field::new("file_count", DataType::Int32, false),
        Field::new("is_merge", DataType::Boolean, false),
    ]))
}

fn changes_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("commit_oid", DataType::Utf8, false),
        Field::new("entity_id", DataType::Int64, false),
        Field::new("change_type", DataType::Int8, false),
        Field::new("insertions", DataType::Int32, false),
        Field::new("deletions", DataType::Int32, false),
        Field::new("old_entity_id", DataType::Int64, true),
    ]))
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension(TMP_EXTENSION)
}

/// Remove leftover temp files from an aborted run.
pub fn clean_partials(parquet_dir: &Path) -> Result<()> {
    if !parquet_dir.exists() {
        return Ok(());
    }

    for entry in std::fs::read_dir(parquet_dir)? {
        let path = entry?.path();
        if path.to_string_lossy().ends_with(TMP_EXTENSION) {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }

    Ok(())
}

/// Streams commit rows into a parquet file. Writes to a temp path; the
/// final path only ever holds a complete file (atomic rename on finish).
pub struct CommitWriter {
    writer: ArrowWriter<File>,
    schema: Arc<Schema>,
    tmp: PathBuf,
    path: PathBuf,
    oids: StringBuilder,
    author_ids: Int64Builder,
    author_ts: Int64Builder,
    committer_ids: Int64Builder,
    committer_ts: Int64Builder,
    subjects: StringBuilder,
    parent_oids: ListBuilder<StringBuilder>,
    file_counts: Int32Builder,
    is_merges: BooleanBuilder,
    buffered: usize,
}

impl CommitWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tmp = tmp_path(&path);
        let schema = commits_schema();
        let file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        let writer = ArrowWriter::try_new(file, schema.clone(), None)?;

        Ok(Self {
            writer,
            schema,
            tmp,
            path,
            oids: StringBuilder::new(),
            author_ids: Int64Builder::new(),
            author_ts: Int64Builder::new(),
            committer_ids: Int64Builder::new(),
            committer_ts: Int64Builder::new(),
            subjects: StringBuilder::new(),
            parent_oids: ListBuilder::new(StringBuilder::new()),
            file_counts: Int32Builder::new(),
            is_merges: BooleanBuilder::new(),
            buffered: 0,
        })
    }

    pub fn append(&mut self, row: &CommitRow) -> Result<()> {
        self.oids.append_value(&row.oid);
        self.author_ids.append_value(row.author_id);
        self.author_ts.append_value(row.author_ts);
        self.committer_ids.append_value(row.committer_id);
        self.committer_ts.append_value(row.committer_ts);
        self.subjects.append_value(&row.subject);

        for parent in &row.parent_oids {
            self.parent_oids.values().append_value(parent);
        }
        self.parent_oids.append(true);

        self.file_counts.append_value(row.file_count);
        self.is_merges.append_value(row.is_merge);
        self.buffered += 1;

        if self.buffered >= BATCH_ROWS {
            self.flush_batch()?;
        }

        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.oids.finish()),
            Arc::new(self.author_ids.finish()),
            Arc::new(self.author_ts.finish()),
            Arc::new(self.committer_ids.finish()),
            Arc::new(self.committer_ts.finish()),
            Arc::new(self.subjects.finish()),
            Arc::new(self.parent_oids.finish()),
            Arc::new(self.file_counts.finish()),
            Arc::new(self.is_merges.finish()),
        ];

        let batch = RecordBatch::try_new(self.schema.clone(), columns)?;
        self.writer.write(&batch)?;
        self.buffered = 0;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.flush_batch()?;
        self.writer.close()?;
        std::fs::rename(&self.tmp, &self.path)
            .with_context(|| format!("failed to move {} into place", self.tmp.display()))?;
        Ok(())
    }
}

pub struct ChangeWriter {
    writer: ArrowWriter<File>,
    schema: Arc<Schema>,
    tmp: PathBuf,
    path: PathBuf,
    oids: StringBuilder,
    entity_ids: Int64Builder,
    change_types: Int8Builder,
    insertions: Int32Builder,
    deletions: Int32Builder,
    old_entity_ids: Int64Builder,
    buffered: usize,
}

impl ChangeWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tmp = tmp_path(&path);
        let schema = changes_schema();
        let file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        let writer = ArrowWriter::try_new(file, schema.clone(), None)?;

        Ok(Self {
            writer,
            schema,
            tmp,
            path,
            oids: StringBuilder::new(),
            entity_ids: Int64Builder::new(),
            change_types: Int8Builder::new(),
            insertions: Int32Builder::new(),
            deletions: Int32Builder::new(),
            old_entity_ids: Int64Builder::new(),
            buffered: 0,
        })
    }

    pub fn append(&mut self, row: &ChangeRow) -> Result<()> {
        self.oids.append_value(&row.commit_oid);
        self.entity_ids.append_value(row.entity_id);
        self.change_types.append_value(row.kind.code());
        self.insertions.append_value(row.insertions);
        self.deletions.append_value(row.deletions);
        self.old_entity_ids.append_option(row.old_entity_id);
        self.buffered += 1;

        if self.buffered >= BATCH_ROWS {
            self.flush_batch()?;
        }

        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        if self.buffered == 0 {
            return Ok(());
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(self.oids.finish()),
            Arc::new(self.entity_ids.finish()),
            Arc::new(self.change_types.finish()),
            Arc::new(self.insertions.finish()),
            Arc::new(self.deletions.finish()),
            Arc::new(self.old_entity_ids.finish()),
        ];

        let batch = RecordBatch::try_new(self.schema.clone(), columns)?;
        self.writer.write(&batch)?;
        self.buffered = 0;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.flush_batch()?;
        self.writer.close()?;
        std::fs::rename(&self.tmp, &self.path)
            .with_context(|| format!("failed to move {} into place", self.tmp.display()))?;
        Ok(())
    }
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, index: usize, name: &str) -> Result<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("unexpected column type for '{}'", name))
}

/// Stream every commit row through the callback, one record batch at a time.
pub fn scan_commits<P, F>(path: P, mut f: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnMut(CommitRow) -> Result<()>,
{
    let file = File::open(path.as_ref())
        .with_context(|| format!("failed to open {}", path.as_ref().display()))?;
    let reader =
        ParquetRecordBatchReaderBuilder::try_new(file)?.with_batch_size(BATCH_ROWS).build()?;

    for batch in reader {
        let batch = batch?;
        let oids: &StringArray = column(&batch, 0, "commit_oid")?;
        let author_ids: &Int64Array = column(&batch, 1, "author_id")?;
        let author_ts: &Int64Array = column(&batch, 2, "author_ts")?;
        let committer_ids: &Int64Array = column(&batch, 3, "committer_id")?;
        let committer_ts: &Int64Array = column(&batch, 4, "committer_ts")?;
        let subjects: &StringArray = column(&batch, 5, "subject")?;
        let parents: &ListArray = column(&batch, 6, "parent_oids")?;
        let file_counts: &Int32Array = column(&batch, 7, "file_count")?;
        let is_merges: &BooleanArray = column(&batch, 8, "is_merge")?;

        for i in 0..batch.num_rows() {
            let parent_values = parents.value(i);
            let parent_values = parent_values
                .as_any()
                .downcast_ref::<StringArray>()
                .context("unexpected parent_oids item type")?;
            let parent_oids =
                (0..parent_values.len()).map(|j| parent_values.value(j).to_string()).collect();

            f(CommitRow {
                oid: oids.value(i).to_string(),
                author_id: author_ids.value(i),
                author_ts: author_ts.value(i),
                committer_id: committer_ids.value(i),
                committer_ts: committer_ts.value(i),
                subject: subjects.value(i).to_string(),
                parent_oids,
                file_count: file_counts.value(i),
                is_merge: is_merges.value(i),
            })?;
        }
    }

    Ok(())
}

/// Stream every change row through the callback.
pub fn scan_changes<P, F>(path: P, mut f: F) -> Result<()>
where
    P: AsRef<Path>,
    F: FnMut(ChangeRow) -> Result<()>,
{
    let file = File::open(path.as_ref())
        .with_context(|| format!("failed to open {}", path.as_ref().display()))?;
    let reader =
        ParquetRecordBatchReaderBuilder::try_new(file)?.with_batch_size(BATCH_ROWS).build()?;

    for batch in reader {
        let batch = batch?;
        let oids: &StringArray = column(&batch, 0, "commit_oid")?;
        let entity_ids: &Int64Array = column(&batch, 1, "entity_id")?;
        let change_types: &Int8Array = column(&batch, 2, "change_type")?;
        let insertions: &Int32Array = column(&batch, 3, "insertions")?;
        let deletions: &Int32Array = column(&batch, 4, "deletions")?;
        let old_entity_ids: &Int64Array = column(&batch, 5, "old_entity_id")?;

        for i in 0..batch.num_rows() {
            let old_entity_id =
                if old_entity_ids.is_null(i) { None } else { Some(old_entity_ids.value(i)) };

            f(ChangeRow {
                commit_oid: oids.value(i).to_string(),
                entity_id: entity_ids.value(i),
                kind: ChangeKind::from_code(change_types.value(i))?,
                insertions: insertions.value(i),
                deletions: deletions.value(i),
                old_entity_id,
            })?;
        }
    }

    Ok(())
}

pub fn read_commits<P: AsRef<Path>>(path: P) -> Result<Vec<CommitRow>> {
    let mut rows = Vec::new();
    scan_commits(path, |row| {
        rows.push(row);
        Ok(())
    })?;
    Ok(rows)
}

pub fn read_changes<P: AsRef<Path>>(path: P) -> Result<Vec<ChangeRow>> {
    let mut rows = Vec::new();
    scan_changes(path, |row| {
        rows.push(row);
        Ok(())
    })?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(oid: &str, parents: Vec<&str>, file_count: i32) -> CommitRow {
        CommitRow {
            oid: oid.to_string(),
            author_id: 1,
            author_ts: 1_700_000_000,
            committer_id: 1,
            committer_ts: 1_700_000_100,
            subject: format!("commit {}", oid),
            parent_oids: parents.into_iter().map(String::from).collect(),
            file_count,
            is_merge: false,
        }
    }

    #[test]
    fn commits_survive_a_write_read_cycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("commits.parquet");

        let mut writer = CommitWriter::create(&path).unwrap();
        writer.append(&commit("aaa", vec![], 2)).unwrap();
        writer.append(&commit("bbb", vec!["aaa"], 5)).unwrap();
        writer.append(&commit("ccc", vec!["aaa", "bbb"], 0)).unwrap();
        writer.finish().unwrap();

        let rows = read_commits(&path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].parent_oids, vec!["aaa".to_string()]);
        assert_eq!(rows[2].parent_oids.len(), 2);
        assert_eq!(rows[1].file_count, 5);
    }

    #[test]
    fn changes_survive_a_write_read_cycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("changes.parquet");

        let mut writer = ChangeWriter::create(&path).unwrap();
        writer
            .append(&ChangeRow {
                commit_oid: "aaa".to_string(),
                entity_id: 7,
                kind: ChangeKind::Rename,
                insertions: 1,
                deletions: 2,
                old_entity_id: Some(3),
            })
            .unwrap();
        writer
            .append(&ChangeRow {
                commit_oid: "aaa".to_string(),
                entity_id: 8,
                kind: ChangeKind::Modify,
                insertions: 10,
                deletions: 0,
                old_entity_id: None,
            })
            .unwrap();
        writer.finish().unwrap();

        let rows = read_changes(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, ChangeKind::Rename);
        assert_eq!(rows[0].old_entity_id, Some(3));
        assert_eq!(rows[1].old_entity_id, None);
    }

    #[test]
    fn empty_tables_are_valid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("commits.parquet");

        CommitWriter::create(&path).unwrap().finish().unwrap();
        assert!(read_commits(&path).unwrap().is_empty());
    }

    #[test]
    fn unfinished_writers_leave_no_final_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("commits.parquet");

        let mut writer = CommitWriter::create(&path).unwrap();
        writer.append(&commit("aaa", vec![], 1)).unwrap();
        drop(writer);

        assert!(!path.exists());
        clean_partials(dir.path()).unwrap();
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
