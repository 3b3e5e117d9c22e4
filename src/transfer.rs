//! Передача файлов кусками: нарезка на отправке, сборка и прогресс на приёме.
//!
//! Незавершённые передачи ключуются только именем файла: два одновременных
//! файла с одинаковым именем испортят друг друга. При двух участниках это
//! недостижимо, для комнат на большее число пиров ключ нужно расширить.

use crate::config::SPEED_EPSILON_SECS;
use crate::error::TransferError;
use crate::logger::FileReady;
use crate::protocol::FileChunk;
use crate::utils::safe_file_name;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Расширение в нижнем регистре вместе с точкой (`.pdf`), либо пустая строка
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Режем байты на куски фиксированного размера; у всех кусков общий timestamp
pub fn split_into_chunks(
    filename: &str,
    bytes: &[u8],
    chunk_size: usize,
    timestamp: f64,
) -> Vec<FileChunk> {
    let ext = extension_of(filename);
    let pieces: Vec<&[u8]> = bytes.chunks(chunk_size.max(1)).collect();
    let total = pieces.len() as u32;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| FileChunk {
            filename: filename.to_string(),
            ext: ext.clone(),
            chunk_id: i as u32,
            total_chunks: total,
            data: piece.to_vec(),
            timestamp,
        })
        .collect()
}

/// Уменьшаем кусок, если иначе кадр не пройдёт через транспорт с пределом `limit`
pub fn fit_chunk_size(
    filename: &str,
    chunk_size: usize,
    limit: usize,
    timestamp: f64,
) -> Result<usize, TransferError> {
    let ext = extension_of(filename);
    let capacity = FileChunk::payload_capacity(filename, &ext, timestamp, limit)?;
    if capacity == 0 {
        return Err(TransferError::FrameLimit {
            filename: filename.to_string(),
            limit,
        });
    }
    if capacity < chunk_size {
        debug!(filename, chunk_size, capacity, limit, "chunk size reduced to fit frame limit");
    }
    Ok(chunk_size.min(capacity))
}

/// Читаем файл целиком и готовим куски к отправке.
/// `frame_limit` задаёт предел длины кадра у транспорта, если он есть.
pub async fn prepare_outbound(
    path: &Path,
    chunk_size: usize,
    frame_limit: Option<usize>,
    timestamp: f64,
) -> Result<Vec<FileChunk>, TransferError> {
    if !tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
    {
        return Err(TransferError::NotFound(path.to_path_buf()));
    }
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::NotFound(path.to_path_buf()))?;
    let raw = tokio::fs::read(path).await.map_err(|source| TransferError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if raw.is_empty() {
        return Err(TransferError::Empty(path.to_path_buf()));
    }
    let chunk_size = match frame_limit {
        Some(limit) => fit_chunk_size(&filename, chunk_size, limit, timestamp)?,
        None => chunk_size,
    };
    let chunks = split_into_chunks(&filename, &raw, chunk_size, timestamp);
    debug!(%filename, bytes = raw.len(), chunks = chunks.len(), "file prepared for sending");
    Ok(chunks)
}

/// Состояние одной входящей передачи
#[derive(Debug)]
struct Transfer {
    ext: String,
    total: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    started_at: f64,
}

impl Transfer {
    fn bytes_received(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }
}

/// Прогресс после очередного куска
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub filename: String,
    pub received: u32,
    pub total: u32,
    pub percent: u32,
    pub bytes: usize,
    /// байт в секунду
    pub speed: f64,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }

    pub fn status_line(&self) -> String {
        format!(
            "Receiving {}: {}% ({} KB/s)",
            self.filename,
            self.percent,
            (self.speed / 1024.0) as u64
        )
    }
}

/// Сборка входящих файлов
#[derive(Debug)]
pub struct Reassembler {
    dir: PathBuf,
    transfers: HashMap<String, Transfer>,
}

impl Reassembler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            transfers: HashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.transfers.len()
    }

    /// Сохраняем кусок; повторный chunk_id перезаписывает прежний
    pub fn store(&mut self, chunk: FileChunk, now: f64) -> Progress {
        let transfer = self
            .transfers
            .entry(chunk.filename.clone())
            .or_insert_with(|| {
                info!(
                    filename = %chunk.filename,
                    total = chunk.total_chunks,
                    "incoming transfer started"
                );
                Transfer {
                    ext: chunk.ext.clone(),
                    total: chunk.total_chunks,
                    chunks: BTreeMap::new(),
                    started_at: chunk.timestamp,
                }
            });

        // объявленное количество фиксируется первым куском
        if chunk.chunk_id < transfer.total {
            transfer.chunks.insert(chunk.chunk_id, chunk.data);
        } else {
            debug!(
                filename = %chunk.filename,
                chunk_id = chunk.chunk_id,
                total = transfer.total,
                "chunk outside declared range ignored"
            );
        }

        let received = transfer.chunks.len() as u32;
        let bytes = transfer.bytes_received();
        let elapsed = (now - transfer.started_at).max(SPEED_EPSILON_SECS);
        Progress {
            filename: chunk.filename,
            received,
            total: transfer.total,
            // половины к чётному, как round в Python
            percent: (received as f64 / transfer.total as f64 * 100.0).round_ties_even() as u32,
            bytes,
            speed: bytes as f64 / elapsed,
        }
    }

    /// Склеиваем куски 0..total и пишем файл; при ошибке записи передача остаётся
    pub async fn assemble(&mut self, filename: &str) -> Result<FileReady, TransferError> {
        let Some(transfer) = self.transfers.get(filename) else {
            return Err(TransferError::NotFound(PathBuf::from(filename)));
        };
        let name = safe_file_name(filename)
            .ok_or_else(|| TransferError::NotFound(PathBuf::from(filename)))?;
        let path = self.dir.join(&name);

        let mut contents = Vec::with_capacity(transfer.bytes_received());
        for piece in transfer.chunks.values() {
            contents.extend_from_slice(piece);
        }

        let write_err = |source: std::io::Error| TransferError::Write {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(write_err)?;
        tokio::fs::write(&path, &contents).await.map_err(write_err)?;

        let ext = transfer.ext.clone();
        self.transfers.remove(filename);
        info!(%name, bytes = contents.len(), path = %path.display(), "file assembled");
        Ok(FileReady {
            name,
            ext,
            path: Some(path),
        })
    }

    /// Бросаем все незавершённые передачи
    pub fn abandon_all(&mut self) -> usize {
        let count = self.transfers.len();
        if count > 0 {
            info!(count, "abandoning incomplete transfers");
        }
        self.transfers.clear();
        count
    }
}
