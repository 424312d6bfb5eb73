use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use browserflow_core_types::TaskId;
use zstd::stream::{read::Decoder, Encoder};

use crate::config::MirrorConfig;
use crate::model::MirrorLine;

/// Append-only JSON Lines file for one task.
pub struct MirrorWriter {
    path: PathBuf,
    sink: Option<Box<dyn Write + Send>>,
    raw_file: Option<File>,
    lines_written: u64,
}

impl MirrorWriter {
    pub fn open(cfg: &MirrorConfig, task_id: &TaskId) -> io::Result<Self> {
        fs::create_dir_all(&cfg.root)?;
        let path = mirror_path(cfg, task_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let sync_file = file.try_clone()?;
        let sink: Box<dyn Write + Send> = if cfg.compress {
            let encoder = Encoder::new(file, 3)?;
            Box::new(encoder.auto_finish())
        } else {
            Box::new(BufWriter::new(file))
        };
        Ok(Self {
            path,
            sink: Some(sink),
            raw_file: Some(sync_file),
            lines_written: 0,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_sink(path: PathBuf, sink: Box<dyn Write + Send>) -> Self {
        Self {
            path,
            sink: Some(sink),
            raw_file: None,
            lines_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn write_line(&mut self, line: &MirrorLine) -> io::Result<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "mirror already finished"))?;
        let raw = serde_json::to_vec(line)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        sink.write_all(&raw)?;
        sink.write_all(b"\n")?;
        self.lines_written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    /// Flush, close the compressed frame if any, and sync to disk.
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
            drop(sink);
        }
        if let Some(file) = self.raw_file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

pub fn mirror_path(cfg: &MirrorConfig, task_id: &TaskId) -> PathBuf {
    let mut file = format!("{task_id}.jsonl");
    if cfg.compress {
        file.push_str(".zst");
    }
    cfg.root.join(file)
}

/// Read a mirror file back, compressed or not. Unparseable lines are skipped.
pub fn read_mirror(path: &Path) -> io::Result<Vec<MirrorLine>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "zst") {
        Box::new(Decoder::new(file)?)
    } else {
        Box::new(file)
    };
    Ok(BufReader::new(reader)
        .lines()
        .map_while(Result::ok)
        .filter_map(|raw| serde_json::from_str::<MirrorLine>(&raw).ok())
        .collect())
}
