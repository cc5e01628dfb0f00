use std::{
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};

use crate::error::{ExecutorError, Result};

/// Object storage externo (OSS, S3...). Sólo se usa a través de este trait.
/// Las operaciones son bloqueantes: llamarlas desde un hilo de bloqueo.
pub trait ObjectStorage: Send + Sync {
    /// Sube un archivo y devuelve el id del objeto.
    fn upload(&self, name: &str, file: &Path) -> Result<String>;

    fn get_object(&self, object_id: &str) -> Result<Box<dyn Read + Send>>;

    fn generate_download_url(&self, object_id: &str) -> Result<String>;

    fn supported(&self) -> bool;
}

/// Object storage sobre un directorio local. Útil en desarrollo y tests.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, object_id: &str) -> Result<PathBuf> {
        // los ids los generamos nosotros; nada de rutas relativas
        if object_id.is_empty()
            || object_id.contains('/')
            || object_id.contains('\\')
            || object_id.contains("..")
        {
            return Err(ExecutorError::Storage(format!(
                "object id inválido: {:?}",
                object_id
            )));
        }
        Ok(self.root.join(object_id))
    }

    /// Guarda bytes directamente; práctico para preparar scripts en tests.
    pub fn put_bytes(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let object_id = format!("{}-{}", uuid::Uuid::new_v4(), sanitize(name));
        fs::write(self.object_path(&object_id)?, bytes)?;
        Ok(object_id)
    }
}

impl ObjectStorage for LocalObjectStorage {
    fn upload(&self, name: &str, file: &Path) -> Result<String> {
        let object_id = format!("{}-{}", uuid::Uuid::new_v4(), sanitize(name));
        fs::copy(file, self.object_path(&object_id)?)?;
        Ok(object_id)
    }

    fn get_object(&self, object_id: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(object_id)?;
        let file = File::open(&path)
            .map_err(|e| ExecutorError::Storage(format!("objeto {} no disponible: {}", object_id, e)))?;
        Ok(Box::new(file))
    }

    fn generate_download_url(&self, object_id: &str) -> Result<String> {
        let path = self.object_path(object_id)?;
        if !path.exists() {
            return Err(ExecutorError::Storage(format!("objeto {} no existe", object_id)));
        }
        Ok(format!("file://{}", path.display()))
    }

    fn supported(&self) -> bool {
        true
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
