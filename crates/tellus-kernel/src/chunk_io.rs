//! Persisted chunk volume files.
//!
//! One file per chunk coordinate, named `chunk_{x}_{y}_{z}.dat`, containing
//! the raw density buffer as a flat sequence of little-endian u32 words with
//! no header. Absence of a file means the chunk has no saved state and must
//! be synthesized fresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::Mutex;
use tracing::{debug, warn};
use wgpu::{Buffer, Device, Queue};

use tellus_common::{ChunkCoord, GpuError, TellusError, TellusResult, WorldError};

const CHUNK_FILE_PREFIX: &str = "chunk_";
const CHUNK_FILE_EXTENSION: &str = ".dat";

/// Returns the file name for a chunk coordinate.
#[must_use]
pub fn chunk_file_name(coord: ChunkCoord) -> String {
    format!(
        "{CHUNK_FILE_PREFIX}{}_{}_{}{CHUNK_FILE_EXTENSION}",
        coord.x, coord.y, coord.z
    )
}

/// Returns the full path of a chunk's volume file.
#[must_use]
pub fn chunk_file_path(directory: &Path, coord: ChunkCoord) -> PathBuf {
    directory.join(chunk_file_name(coord))
}

/// Parses a chunk coordinate out of a file name.
///
/// Returns `None` for names that are not well-formed chunk files.
#[must_use]
pub fn parse_chunk_file_name(name: &str) -> Option<ChunkCoord> {
    let stem = name
        .strip_prefix(CHUNK_FILE_PREFIX)?
        .strip_suffix(CHUNK_FILE_EXTENSION)?;

    let mut parts = stem.split('_');
    let x = parts.next()?.parse().ok()?;
    let y: i32 = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let coord = ChunkCoord { x, y, z };
    Some(coord)
}

/// Scans the chunk directory and returns the coordinates with saved volumes.
///
/// A missing directory is not an error; it simply means nothing has been
/// saved yet.
#[must_use]
pub fn scan_chunk_directory(directory: &Path) -> AHashSet<ChunkCoord> {
    let mut saved = AHashSet::new();

    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("Chunk directory {} not readable: {err}", directory.display());
            return saved;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(CHUNK_FILE_PREFIX) {
            continue;
        }
        match parse_chunk_file_name(name) {
            Some(coord) => {
                saved.insert(coord);
            }
            None => warn!("Ignoring chunk file with invalid name: {name}"),
        }
    }

    debug!(
        "Found {} saved chunks in {}",
        saved.len(),
        directory.display()
    );
    saved
}

/// Reads a GPU buffer back to the host, blocking until the copy completes.
///
/// Export is an explicit, infrequent operation; unlike the mesh pipeline it
/// is allowed to wait on the device.
fn read_buffer_blocking(device: &Device, queue: &Queue, buffer: &Buffer) -> TellusResult<Vec<u8>> {
    let size = buffer.size();
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Volume Export Staging"),
        size,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Volume Export Encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
    queue.submit(std::iter::once(encoder.finish()));

    let result_slot = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result_slot);
    staging
        .slice(..)
        .map_async(wgpu::MapMode::Read, move |result| {
            *slot.lock() = Some(result);
        });

    while result_slot.lock().is_none() {
        device.poll(wgpu::Maintain::Wait);
    }

    let result = result_slot.lock().take();
    if let Some(Err(err)) = result {
        return Err(GpuError::ReadbackFault(err.to_string()).into());
    }

    let bytes = staging.slice(..).get_mapped_range().to_vec();
    staging.unmap();
    Ok(bytes)
}

/// Exports a chunk's density buffer to its volume file.
pub fn export_volume(
    device: &Device,
    queue: &Queue,
    volume: &Buffer,
    directory: &Path,
    coord: ChunkCoord,
) -> TellusResult<()> {
    let bytes = read_buffer_blocking(device, queue, volume)?;

    std::fs::create_dir_all(directory)?;
    let path = chunk_file_path(directory, coord);
    std::fs::write(&path, &bytes).map_err(|err| {
        TellusError::World(WorldError::SaveFailed(format!(
            "{}: {err}",
            path.display()
        )))
    })?;

    debug!("Exported {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Imports a chunk's volume file into its density buffer.
///
/// The file must contain exactly the buffer's byte length; anything else is
/// treated as corrupt saved state.
pub fn import_volume(
    queue: &Queue,
    volume: &Buffer,
    directory: &Path,
    coord: ChunkCoord,
) -> TellusResult<()> {
    let path = chunk_file_path(directory, coord);
    let bytes = std::fs::read(&path).map_err(|err| {
        TellusError::World(WorldError::LoadFailed(format!(
            "{}: {err}",
            path.display()
        )))
    })?;

    if bytes.len() as u64 != volume.size() || bytes.len() % std::mem::size_of::<u32>() != 0 {
        return Err(WorldError::InvalidData(format!(
            "{}: expected {} bytes, found {}",
            path.display(),
            volume.size(),
            bytes.len()
        ))
        .into());
    }

    queue.write_buffer(volume, 0, &bytes);
    debug!("Imported {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::create_validated_instance;

    #[test]
    fn test_file_name_round_trip() {
        let coords = [
            ChunkCoord::new(0, 0),
            ChunkCoord::new(12, -7),
            ChunkCoord::new(-100, 245),
        ];
        for coord in coords {
            let name = chunk_file_name(coord);
            assert_eq!(parse_chunk_file_name(&name), Some(coord));
        }
    }

    #[test]
    fn test_file_name_format() {
        assert_eq!(chunk_file_name(ChunkCoord::new(3, -2)), "chunk_3_0_-2.dat");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert_eq!(parse_chunk_file_name("chunk_1_2.dat"), None);
        assert_eq!(parse_chunk_file_name("chunk_1_2_3_4.dat"), None);
        assert_eq!(parse_chunk_file_name("chunk_a_b_c.dat"), None);
        assert_eq!(parse_chunk_file_name("terrain_1_2_3.dat"), None);
        assert_eq!(parse_chunk_file_name("chunk_1_2_3.bin"), None);
    }

    #[test]
    fn test_scan_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chunk_1_0_2.dat"), b"x").unwrap();
        std::fs::write(dir.path().join("chunk_-3_0_4.dat"), b"x").unwrap();
        std::fs::write(dir.path().join("chunk_bogus.dat"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let saved = scan_chunk_directory(dir.path());
        assert_eq!(saved.len(), 2);
        assert!(saved.contains(&ChunkCoord::new(1, 2)));
        assert!(saved.contains(&ChunkCoord::new(-3, 4)));
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nothing-here");
        assert!(scan_chunk_directory(&missing).is_empty());
    }

    #[test]
    fn test_export_import_round_trip() {
        let instance = create_validated_instance();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: true,
        }));
        let Some(adapter) = adapter else { return };
        let Ok((device, queue)) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None))
        else {
            return;
        };

        let words: Vec<u32> = (0..256).map(|i| i * 31 + 7).collect();
        let create = || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("round trip volume"),
                size: (words.len() * std::mem::size_of::<u32>()) as u64,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        };

        let dir = tempfile::tempdir().unwrap();
        let coord = ChunkCoord::new(4, -9);

        let source = create();
        queue.write_buffer(&source, 0, bytemuck::cast_slice(&words));
        export_volume(&device, &queue, &source, dir.path(), coord).unwrap();

        let target = create();
        import_volume(&queue, &target, dir.path(), coord).unwrap();

        // Byte-for-byte identical after the round trip.
        let restored = read_buffer_blocking(&device, &queue, &target).unwrap();
        assert_eq!(restored, bytemuck::cast_slice::<u32, u8>(&words));
    }

    #[test]
    fn test_import_rejects_wrong_length() {
        let instance = create_validated_instance();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: true,
        }));
        let Some(adapter) = adapter else { return };
        let Ok((device, queue)) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None))
        else {
            return;
        };

        let volume = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("volume"),
            size: 64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let dir = tempfile::tempdir().unwrap();
        let coord = ChunkCoord::new(0, 0);
        std::fs::write(chunk_file_path(dir.path(), coord), vec![0u8; 32]).unwrap();

        assert!(import_volume(&queue, &volume, dir.path(), coord).is_err());
    }
}
