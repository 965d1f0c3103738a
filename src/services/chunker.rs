use std::io::{Read, Write};

use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::chunk::Chunk;
use crate::models::file::FileMetadata;

/// SHA-256 of a byte slice, hex-lowercase.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| AppError::Internal(format!("chunk compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| AppError::Internal(format!("chunk compression failed: {}", e)))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AppError::IntegrityFailed(format!("chunk decompression failed: {}", e)))?;
    Ok(out)
}

/// Splits a payload into compressed, checksummed chunks plus its metadata
/// descriptor.
///
/// Slices are `config.chunk_size` bytes of plaintext; each is gzip
/// compressed and carries the SHA-256 of its uncompressed bytes. Chunks are
/// emitted with dense, zero-based, ascending indices. The metadata checksum
/// covers the whole plaintext.
pub fn chunk_payload(
    config: &Config,
    file_id: Uuid,
    payload: &[u8],
    original_filename: &str,
    content_type: &str,
    owner: Option<String>,
    btl_days: u32,
    expiration_block: u64,
) -> Result<(FileMetadata, Vec<Chunk>)> {
    let created_at = Utc::now();

    let mut chunks = Vec::with_capacity(payload.len().div_ceil(config.chunk_size));
    for (index, slice) in payload.chunks(config.chunk_size).enumerate() {
        let data = compress(slice)?;
        chunks.push(Chunk {
            id: Uuid::new_v4(),
            file_id,
            chunk_index: index as u32,
            compressed_size: data.len() as u64,
            data,
            original_size: slice.len() as u64,
            checksum: sha256_hex(slice),
            created_at,
            expiration_block,
            ledger_key: None,
        });
    }

    let metadata = FileMetadata {
        file_id,
        original_filename: original_filename.to_string(),
        // Stored normalized so the content-type attribute index matches
        // lowercase queries.
        content_type: content_type.trim().to_lowercase(),
        file_extension: FileMetadata::extension_of(original_filename),
        total_size: payload.len() as u64,
        chunk_count: chunks.len() as u32,
        checksum: sha256_hex(payload),
        created_at,
        expiration_block,
        btl_days,
        ledger_key: None,
        owner,
    };

    Ok((metadata, chunks))
}

/// Rebuilds the payload from its chunk set and verifies integrity.
///
/// Chunks are sorted by index, decompressed and concatenated; the result's
/// SHA-256 must equal the metadata checksum. A short or overlong chunk set
/// fails before any decompression happens.
pub fn reassemble(metadata: &FileMetadata, mut chunks: Vec<Chunk>) -> Result<Vec<u8>> {
    if chunks.len() != metadata.chunk_count as usize {
        return Err(AppError::FileIncomplete {
            found: chunks.len() as u32,
            expected: metadata.chunk_count,
        });
    }

    chunks.sort_by_key(|c| c.chunk_index);

    let mut payload = Vec::with_capacity(metadata.total_size as usize);
    for chunk in &chunks {
        let slice = decompress(&chunk.data)?;
        payload.extend_from_slice(&slice);
    }

    let checksum = sha256_hex(&payload);
    if checksum != metadata.checksum {
        return Err(AppError::IntegrityFailed(format!(
            "file {} expected {}, got {}",
            metadata.file_id, metadata.checksum, checksum
        )));
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::for_memory_mode();
        config.chunk_size = 8;
        config
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let config = config();
        let payload = b"the quick brown fox jumps over the lazy dog";
        let (metadata, chunks) = chunk_payload(
            &config,
            Uuid::new_v4(),
            payload,
            "fox.txt",
            "text/plain",
            None,
            7,
            5_000,
        )
        .unwrap();

        assert_eq!(metadata.chunk_count as usize, payload.len().div_ceil(8));
        assert_eq!(metadata.total_size, payload.len() as u64);
        assert_eq!(metadata.file_extension, "txt");
        assert_eq!(
            metadata.total_size,
            chunks.iter().map(|c| c.original_size).sum::<u64>()
        );

        let rebuilt = reassemble(&metadata, chunks).unwrap();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn single_chunk_file_has_index_zero() {
        let config = config();
        let (metadata, chunks) =
            chunk_payload(&config, Uuid::new_v4(), b"tiny", "t", "text/plain", None, 1, 5_000)
                .unwrap();
        assert_eq!(metadata.chunk_count, 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn short_chunk_set_is_incomplete() {
        let config = config();
        let (metadata, mut chunks) = chunk_payload(
            &config,
            Uuid::new_v4(),
            &[7u8; 64],
            "data.bin",
            "application/octet-stream",
            None,
            7,
            5_000,
        )
        .unwrap();
        chunks.pop();

        match reassemble(&metadata, chunks) {
            Err(AppError::FileIncomplete { found, expected }) => {
                assert_eq!(expected, metadata.chunk_count);
                assert_eq!(found, metadata.chunk_count - 1);
            }
            other => panic!("expected FileIncomplete, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn corrupted_chunk_fails_integrity() {
        let config = config();
        let payload: Vec<u8> = (0..100u8).collect();
        let (metadata, chunks) = chunk_payload(
            &config,
            Uuid::new_v4(),
            &payload,
            "blob",
            "application/octet-stream",
            None,
            7,
            5_000,
        )
        .unwrap();

        // Swap two chunks' contents but keep their indices dense.
        let mut tampered = chunks;
        let data = tampered[0].data.clone();
        tampered[0].data = tampered[1].data.clone();
        tampered[1].data = data;

        match reassemble(&metadata, tampered) {
            Err(AppError::IntegrityFailed(_)) => {}
            other => panic!("expected IntegrityFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn extension_rules() {
        assert_eq!(FileMetadata::extension_of("report.PDF"), "pdf");
        assert_eq!(FileMetadata::extension_of("archive.tar.gz"), "gz");
        assert_eq!(FileMetadata::extension_of("README"), "");
        assert_eq!(FileMetadata::extension_of(".bashrc"), "");
        assert_eq!(FileMetadata::extension_of("trailing."), "");
    }
}
