//! Universal compaction: picking and background rewriting.
//!
//! The picker chooses a contiguous prefix of the run sequence (level-0 runs
//! newest first, then the upper levels) by a size-ratio heuristic, extending
//! the prefix while the next run is not disproportionately larger than the
//! runs accumulated so far. The rewrite merges the picked runs through the
//! loser tree and the configured merge function into a single run at the
//! output level.
//!
//! Rewrites run on a dedicated single-threaded executor per bucket. The
//! writer and the executor share nothing mutable: requests travel over one
//! channel, finished [`CompactResult`]s travel back over another, and the
//! writer folds them into its levels on the next `prepare_commit`.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

use crate::config::{ChangelogProducer, CoreOptions};
use crate::error::{Error, Result};
use crate::file::{DataFileMeta, DataFilePathFactory, KeyValueFileReader, RollingFileWriter};
use crate::mergetree::levels::{LevelSortedRun, Levels};
use crate::mergetree::loser_tree::{KeyValueIter, LoserTree};
use crate::mergetree::merge::MergeFunction;
use crate::schema::TableSchema;

/// The files of one compaction and the level their merge lands on.
#[derive(Clone, Debug)]
pub struct CompactUnit {
    pub output_level: usize,
    pub files: Vec<DataFileMeta>,
}

#[derive(Debug)]
pub struct CompactRequest {
    pub unit: CompactUnit,
    /// Deletes can be dropped only when the output reaches the max level:
    /// below it an older version of the key may still live deeper down.
    pub drop_delete: bool,
}

#[derive(Debug, Default)]
pub struct CompactResult {
    pub before: Vec<DataFileMeta>,
    pub after: Vec<DataFileMeta>,
    pub changelog: Vec<DataFileMeta>,
}

/// Picks the next compaction, or `None` while the run count is below the
/// trigger. `size_ratio` is a percentage: run `n+1` joins the prefix while
/// `size(n+1) <= accumulated * (100 + size_ratio) / 100`.
pub fn pick_compaction(
    levels: &Levels,
    trigger: usize,
    size_ratio: usize,
) -> Option<CompactUnit> {
    let runs = levels.run_candidates();
    let count = runs.len();
    if count < trigger.max(2) {
        return None;
    }

    let mut picked = 1;
    let mut accumulated = runs[0].total_size();
    while picked < count {
        let next = runs[picked].total_size();
        if next > accumulated * (100 + size_ratio as u64) / 100 {
            break;
        }
        accumulated += next;
        picked += 1;
    }
    // Merging the prefix into one run must leave fewer than `trigger` runs,
    // otherwise every write would immediately re-trigger.
    let forced = (count + 2).saturating_sub(trigger);
    let picked = picked.max(forced).min(count);

    let output_level = if picked == count {
        levels.max_level()
    } else {
        runs[picked].level.saturating_sub(1)
    };
    Some(unit(&runs[..picked], output_level))
}

fn unit(runs: &[LevelSortedRun], output_level: usize) -> CompactUnit {
    CompactUnit {
        output_level,
        files: runs.iter().flat_map(|run| run.files.clone()).collect(),
    }
}

/// Merges the files of one [`CompactUnit`] into fresh files at the output
/// level. Owned entirely by the executor thread.
pub struct CompactRewriter {
    factory: DataFilePathFactory,
    options: CoreOptions,
    schema: TableSchema,
    key_indices: Vec<usize>,
}

impl CompactRewriter {
    pub fn new(
        factory: DataFilePathFactory,
        options: CoreOptions,
        schema: TableSchema,
        key_indices: Vec<usize>,
    ) -> Self {
        Self {
            factory,
            options,
            schema,
            key_indices,
        }
    }

    pub fn rewrite(&self, request: &CompactRequest) -> Result<CompactResult> {
        let unit = &request.unit;
        let inputs: Vec<KeyValueIter> = unit
            .files
            .iter()
            .map(|file| {
                KeyValueFileReader::open(self.factory.to_path(&file.file_name))
                    .map(|reader| Box::new(reader) as KeyValueIter)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tree = LoserTree::new(inputs)?;
        let mut merge = MergeFunction::create(&self.options, &self.schema)?;
        // A level-0 output must stay a single file: every level-0 file counts
        // as its own sorted run, so rolling there would undo the reduction.
        let target_file_size = if unit.output_level == 0 {
            u64::MAX
        } else {
            self.options.target_file_size
        };
        let mut writer = RollingFileWriter::new(
            self.factory.clone(),
            self.schema.id,
            self.schema.fields.len(),
            self.key_indices.clone(),
            unit.output_level,
            target_file_size,
        );

        // Full-compaction changelog: the merged view becomes visible to
        // changelog readers when the merge reaches the max level.
        let mut changelog_writer = if self.options.changelog_producer
            == ChangelogProducer::FullCompaction
            && unit.output_level == self.options.max_level()
        {
            Some(RollingFileWriter::new(
                self.factory.clone(),
                self.schema.id,
                self.schema.fields.len(),
                self.key_indices.clone(),
                unit.output_level,
                self.options.target_file_size,
            ))
        } else {
            None
        };

        loop {
            tree.adjust_for_next_loop();
            if tree.peek_winner().is_none() {
                break;
            }
            merge.reset();
            while let Some(kv) = tree.pop_winner()? {
                merge.add(kv)?;
            }
            if let Some(result) = merge.result()? {
                if let Some(changelog) = changelog_writer.as_mut() {
                    changelog.write(&result)?;
                }
                if !(request.drop_delete && result.kind.is_retract()) {
                    writer.write(&result)?;
                }
            }
        }

        let after = writer.finish()?;
        let changelog = match changelog_writer {
            Some(writer) => writer
                .finish()?
                .into_iter()
                .map(|meta| rename_changelog(&self.factory, meta))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(CompactResult {
            before: unit.files.clone(),
            after,
            changelog,
        })
    }
}

/// Changelog output is produced through the ordinary rolling writer and then
/// moved onto a changelog file name so scans can tell the two apart.
fn rename_changelog(factory: &DataFilePathFactory, meta: DataFileMeta) -> Result<DataFileMeta> {
    let (name, path) = factory.new_changelog_file();
    std::fs::rename(factory.to_path(&meta.file_name), path)?;
    Ok(DataFileMeta {
        file_name: name,
        ..meta
    })
}

/// Single-threaded background executor for one bucket writer.
pub struct CompactExecutor {
    request_tx: Option<Sender<CompactRequest>>,
    result_rx: Receiver<Result<CompactResult>>,
    handle: Option<JoinHandle<()>>,
}

impl CompactExecutor {
    pub fn start(rewriter: CompactRewriter) -> Self {
        let (request_tx, request_rx) = std::sync::mpsc::channel::<CompactRequest>();
        let (result_tx, result_rx) = std::sync::mpsc::channel();

        let handle = std::thread::spawn(move || {
            while let Ok(request) = request_rx.recv() {
                let result = rewriter.rewrite(&request);
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });

        Self {
            request_tx: Some(request_tx),
            result_rx,
            handle: Some(handle),
        }
    }

    pub fn submit(&self, request: CompactRequest) -> Result<()> {
        self.request_tx
            .as_ref()
            .ok_or_else(|| Error::CompactionFailed("executor closed".to_string()))?
            .send(request)
            .map_err(|_| Error::CompactionFailed("executor thread gone".to_string()))
    }

    /// Non-blocking poll for a finished compaction.
    pub fn try_fetch(&self) -> Result<Option<Result<CompactResult>>> {
        match self.result_rx.try_recv() {
            Ok(result) => Ok(Some(result)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::CompactionFailed(
                "executor thread gone".to_string(),
            )),
        }
    }

    /// Blocks until the in-flight compaction finishes.
    pub fn fetch(&self) -> Result<Result<CompactResult>> {
        self.result_rx
            .recv()
            .map_err(|_| Error::CompactionFailed("executor thread gone".to_string()))
    }

    /// Stops the executor; any queued request is abandoned.
    pub fn close(&mut self) {
        self.request_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CompactExecutor {
    fn drop(&mut self) {
        self.close();
    }
}
