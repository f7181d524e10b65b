/// Persistence backends for the local slave data model
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
///
/// Uniform contract over three storage strategies:
///
/// - **Memory**: non-persistent; `load` returns a zeroed model and every
///   other operation is a no-op.
/// - **File (write-through)**: `load` opens or creates a backing file of
///   exactly 393216 bytes and reads it into a heap slab; `on_write`
///   rewrites the whole slab at offset 0 and fsyncs. Write amplification
///   is accepted for simplicity.
/// - **Memory-mapped**: `load` maps the backing file read/write shared and
///   hands the map to the model (zero-copy); `on_write` issues a
///   synchronous flush of the mapped region.
///
/// `on_write` failures are logged and never fail the Modbus write that
/// triggered them: the in-memory mutation has already succeeded, so the
/// guarantee degrades to best-effort durability. The register regions of
/// the backing are host-endian; a backing written on a little-endian host
/// is not readable on a big-endian one.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{error, info};
use memmap2::MmapOptions;

use crate::config::PersistenceConfig;
use crate::data_model::{DataModel, Table, TOTAL_SIZE};
use crate::error::{GatewayError, GatewayResult};

/// Storage strategy for the local slave data model.
pub trait Storage: Send + Sync {
    /// Load the data model from the backing. Creates and sizes the backing
    /// if it does not exist yet.
    fn load(&mut self) -> GatewayResult<DataModel>;

    /// Persist the full model to the backing.
    fn save(&self, model: &DataModel) -> GatewayResult<()>;

    /// Hook invoked after each successful write to the model. Failures are
    /// logged, not propagated.
    fn on_write(&self, model: &DataModel, table: Table, address: u16, quantity: u16);

    /// Release the backing resources.
    fn close(&self) -> GatewayResult<()>;
}

/// Build the storage backend selected by the configuration.
pub fn open_storage(cfg: &PersistenceConfig) -> GatewayResult<Box<dyn Storage>> {
    match cfg.kind.as_str() {
        "file" => {
            info!("local slave persistence: file write-through at {}", cfg.path);
            Ok(Box::new(FileStorage::new(&cfg.path)))
        }
        "mmap" => {
            info!("local slave persistence: memory map at {}", cfg.path);
            Ok(Box::new(MmapStorage::new(&cfg.path)))
        }
        "memory" | "" => {
            info!("local slave persistence: memory only (non-persistent)");
            Ok(Box::new(MemoryStorage))
        }
        other => Err(GatewayError::configuration(format!(
            "unknown persistence type: {}",
            other
        ))),
    }
}

/// Non-persistent storage.
pub struct MemoryStorage;

impl Storage for MemoryStorage {
    fn load(&mut self) -> GatewayResult<DataModel> {
        Ok(DataModel::new())
    }

    fn save(&self, _model: &DataModel) -> GatewayResult<()> {
        Ok(())
    }

    fn on_write(&self, _model: &DataModel, _table: Table, _address: u16, _quantity: u16) {}

    fn close(&self) -> GatewayResult<()> {
        Ok(())
    }
}

/// Write-through file storage.
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    fn write_out(&self, model: &DataModel) -> GatewayResult<()> {
        let mut guard = self.file.lock().unwrap();
        let file = guard
            .as_mut()
            .ok_or_else(|| GatewayError::persistence("file backing not loaded"))?;

        model.with_raw(|bytes| -> GatewayResult<()> {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(bytes)?;
            file.sync_data()?;
            Ok(())
        })
    }
}

impl Storage for FileStorage {
    fn load(&mut self) -> GatewayResult<DataModel> {
        let mut file = open_backing(&self.path)?;

        let mut buf = vec![0u8; TOTAL_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;

        *self.file.lock().unwrap() = Some(file);
        DataModel::from_bytes(buf)
    }

    fn save(&self, model: &DataModel) -> GatewayResult<()> {
        self.write_out(model)
    }

    fn on_write(&self, model: &DataModel, _table: Table, _address: u16, _quantity: u16) {
        if let Err(e) = self.write_out(model) {
            error!("failed to sync file backing {}: {}", self.path.display(), e);
        }
    }

    fn close(&self) -> GatewayResult<()> {
        if let Some(file) = self.file.lock().unwrap().take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Memory-mapped storage.
///
/// The model owns the map; dropping the model unmaps the region. This
/// backing is explicitly host-endian-dependent and portable only across
/// architectures of the same byte order.
pub struct MmapStorage {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl MmapStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }
}

impl Storage for MmapStorage {
    fn load(&mut self) -> GatewayResult<DataModel> {
        let file = open_backing(&self.path)?;

        // Safety: the map stays valid for the model's lifetime because the
        // file is sized before mapping and only this process writes it.
        let map = unsafe {
            MmapOptions::new()
                .len(TOTAL_SIZE)
                .map_mut(&file)
                .map_err(|e| {
                    GatewayError::persistence(format!(
                        "failed to map {}: {}",
                        self.path.display(),
                        e
                    ))
                })?
        };

        *self.file.lock().unwrap() = Some(file);
        DataModel::from_mmap(map)
    }

    fn save(&self, model: &DataModel) -> GatewayResult<()> {
        model.flush()
    }

    fn on_write(&self, model: &DataModel, _table: Table, _address: u16, _quantity: u16) {
        if let Err(e) = model.flush() {
            error!("failed to sync mmap backing {}: {}", self.path.display(), e);
        }
    }

    fn close(&self) -> GatewayResult<()> {
        self.file.lock().unwrap().take();
        Ok(())
    }
}

/// Open (or create) a backing file and force it to exactly the slab size.
fn open_backing(path: &Path) -> GatewayResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .map_err(|e| {
            GatewayError::persistence(format!("failed to open {}: {}", path.display(), e))
        })?;

    let len = file
        .metadata()
        .map_err(|e| GatewayError::persistence(format!("stat failed: {}", e)))?
        .len();
    if len != TOTAL_SIZE as u64 {
        file.set_len(TOTAL_SIZE as u64).map_err(|e| {
            GatewayError::persistence(format!("failed to resize {}: {}", path.display(), e))
        })?;
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::Table;

    #[test]
    fn test_memory_storage_zeroed() {
        let mut storage = MemoryStorage;
        let model = storage.load().unwrap();
        assert_eq!(model.read_holding_registers(0, 4).unwrap(), vec![0u8; 8]);
        storage.on_write(&model, Table::HoldingRegisters, 0, 1);
        storage.close().unwrap();
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.dat");

        {
            let mut storage = FileStorage::new(&path);
            let model = storage.load().unwrap();
            model
                .write_multiple_registers(10, 2, &[0xCA, 0xFE, 0xBE, 0xEF])
                .unwrap();
            storage.on_write(&model, Table::HoldingRegisters, 10, 2);
            storage.close().unwrap();
        }

        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            TOTAL_SIZE as u64
        );

        // A fresh process sees the same bytes
        let mut storage = FileStorage::new(&path);
        let model = storage.load().unwrap();
        assert_eq!(
            model.read_holding_registers(10, 2).unwrap(),
            vec![0xCA, 0xFE, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_mmap_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.mmap");

        {
            let mut storage = MmapStorage::new(&path);
            let model = storage.load().unwrap();
            model.write_single_register(10, 0xCAFE).unwrap();
            model.write_single_coil(3, 0xFF00).unwrap();
            storage.on_write(&model, Table::HoldingRegisters, 10, 1);
            storage.close().unwrap();
            drop(model);
        }

        let mut storage = MmapStorage::new(&path);
        let model = storage.load().unwrap();
        assert_eq!(
            model.read_holding_registers(10, 1).unwrap(),
            vec![0xCA, 0xFE]
        );
        assert_eq!(model.read_coils(3, 1).unwrap(), vec![0x01]);
    }

    #[test]
    fn test_backing_resized_to_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.dat");
        std::fs::write(&path, b"not the right size").unwrap();

        let mut storage = FileStorage::new(&path);
        let model = storage.load().unwrap();
        drop(model);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), TOTAL_SIZE as u64);
    }

    #[test]
    fn test_unknown_persistence_type() {
        let cfg = PersistenceConfig {
            kind: "sql".to_string(),
            path: String::new(),
        };
        assert!(open_storage(&cfg).is_err());
    }
}
