//! Persistent metadata store using heed (LMDB).
//!
//! Fields are keyed by device address and metadata key; values are the raw
//! UTF-8 bytes the sync pass writes.

use std::{
   borrow::Cow,
   path::{Path, PathBuf},
   sync::Arc,
};

use bluer::Address;
use heed::{Database, Env, EnvOpenOptions, types::Bytes};
use log::info;
use thiserror::Error;

use crate::{
   airpods::metadata::{MetadataKey, MetadataStore},
   error::Result,
};

/// Errors that can occur in metadata store operations.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Failed to create metadata directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

const ENV_DB_PATH: &str = "PODBATTERY_METADATA_DB_PATH";
const KEY_LEN: usize = 7;

/// `(address, key)` encoded as the 6 address bytes followed by the key number.
struct KeyCodec;

impl<'a> heed::BytesEncode<'a> for KeyCodec {
   type EItem = (Address, MetadataKey);
   fn bytes_encode(
      (address, key): &'a Self::EItem,
   ) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      let mut buf = [0u8; KEY_LEN];
      buf[..6].copy_from_slice(&address.0);
      buf[6] = *key as u8;
      Ok(Cow::Owned(buf.to_vec()))
   }
}

impl<'a> heed::BytesDecode<'a> for KeyCodec {
   type DItem = (Address, MetadataKey);
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let invalid = |what: &str| {
         heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid {what}"),
         ))
      };
      let Ok(raw) = <[u8; KEY_LEN]>::try_from(bytes) else {
         return Err(invalid("metadata key length"));
      };
      let mut address = [0u8; 6];
      address.copy_from_slice(&raw[..6]);
      let key = MetadataKey::from_repr(raw[6]).ok_or_else(|| invalid("metadata key"))?;
      Ok((Address(address), key))
   }
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// (MAC address, key) -> value bytes
   fields: Database<KeyCodec, Bytes>,
}

/// Thread-safe handle to the metadata database.
#[derive(Clone, Debug)]
pub struct MetadataDb {
   db: Arc<Db>,
}

impl MetadataDb {
   /// Opens or creates the database at `path`, or at the default location.
   pub fn open(path: Option<&Path>) -> Result<Self> {
      let path = match path {
         Some(path) => path.to_path_buf(),
         None => Self::db_path()?,
      };
      std::fs::create_dir_all(&path).map_err(Error::CreateDirectory)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(4 * 1024 * 1024)
            .max_dbs(1)
            .open(&path)
            .map_err(Error::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(Error::Transaction)?;
      let fields = env
         .create_database(&mut wtxn, Some("fields"))
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;

      info!("Opened metadata store at {}", path.display());
      Ok(Self {
         db: Arc::new(Db { env, fields }),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var(ENV_DB_PATH) {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/podbattery/metadata.db
      let base = dirs::data_local_dir().ok_or(Error::DataDirectoryNotFound)?;
      Ok(base.join("podbattery").join("metadata.db"))
   }
}

impl MetadataStore for MetadataDb {
   fn get(&self, device: Address, key: MetadataKey) -> Result<Option<Vec<u8>>> {
      let rtxn = self.db.env.read_txn().map_err(Error::Transaction)?;
      let value = self
         .db
         .fields
         .get(&rtxn, &(device, key))
         .map_err(Error::DatabaseOperation)?;
      Ok(value.map(<[u8]>::to_vec))
   }

   fn set(&self, device: Address, key: MetadataKey, value: &[u8]) -> Result<()> {
      let mut wtxn = self.db.env.write_txn().map_err(Error::Transaction)?;
      self
         .db
         .fields
         .put(&mut wtxn, &(device, key), value)
         .map_err(Error::DatabaseOperation)?;
      wtxn.commit().map_err(Error::Transaction)?;
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use heed::{BytesDecode, BytesEncode};
   use tempfile::TempDir;

   use super::*;

   const TEST_ADDRESS: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
   const OTHER_ADDRESS: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

   fn create_test_db() -> Result<(MetadataDb, TempDir)> {
      let temp_dir = TempDir::new().unwrap();
      let db = MetadataDb::open(Some(&temp_dir.path().join("metadata.db")))?;
      Ok((db, temp_dir))
   }

   #[test]
   fn test_key_codec() {
      let item = (TEST_ADDRESS, MetadataKey::MainLowBatteryThreshold);
      let bytes = KeyCodec::bytes_encode(&item).unwrap();
      assert_eq!(&*bytes, &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 20]);
      assert_eq!(KeyCodec::bytes_decode(&bytes).unwrap(), item);

      assert!(KeyCodec::bytes_decode(&[0xAA, 0xBB]).is_err());
      assert!(KeyCodec::bytes_decode(&[0, 0, 0, 0, 0, 0, 2]).is_err());
   }

   #[test]
   fn test_get_and_set() -> Result<()> {
      let (db, _dir) = create_test_db()?;

      assert_eq!(db.get(TEST_ADDRESS, MetadataKey::ModelName)?, None);
      db.set(TEST_ADDRESS, MetadataKey::ModelName, b"AirPods Pro")?;
      assert_eq!(
         db.get(TEST_ADDRESS, MetadataKey::ModelName)?.as_deref(),
         Some(b"AirPods Pro".as_slice())
      );

      db.set(TEST_ADDRESS, MetadataKey::ModelName, b"AirPods")?;
      assert_eq!(
         db.get(TEST_ADDRESS, MetadataKey::ModelName)?.as_deref(),
         Some(b"AirPods".as_slice())
      );
      assert_eq!(db.get(OTHER_ADDRESS, MetadataKey::ModelName)?, None);

      Ok(())
   }

   #[test]
   fn test_entries_are_per_device() -> Result<()> {
      let (db, _dir) = create_test_db()?;

      db.set(TEST_ADDRESS, MetadataKey::MainBattery, b"70")?;
      db.set(TEST_ADDRESS, MetadataKey::ManufacturerName, b"Apple Inc.")?;
      db.set(OTHER_ADDRESS, MetadataKey::MainBattery, b"10")?;

      let entries = db.entries(TEST_ADDRESS)?;
      assert_eq!(
         entries,
         vec![
            (MetadataKey::ManufacturerName, b"Apple Inc.".to_vec()),
            (MetadataKey::MainBattery, b"70".to_vec()),
         ]
      );
      assert_eq!(db.entries(OTHER_ADDRESS)?.len(), 1);

      Ok(())
   }

   #[test]
   fn test_clones_share_environment() -> Result<()> {
      let (db, _dir) = create_test_db()?;
      let shared: Arc<dyn MetadataStore> = Arc::new(db.clone());

      shared.set(TEST_ADDRESS, MetadataKey::MainCharging, b"true")?;
      assert_eq!(
         db.get(TEST_ADDRESS, MetadataKey::MainCharging)?.as_deref(),
         Some(b"true".as_slice())
      );

      Ok(())
   }
}
