//! Loading service definitions into a descriptor pool.
//!
//! Definitions come either from `.proto` files compiled at runtime or from
//! a pre-built package definition; exactly one source must be configured.

use std::path::PathBuf;

use bytes::Bytes;
use courier_core::TransportError;
use courier_settings::GrpcOptions;
use prost_reflect::DescriptorPool;
use tracing::debug;

use crate::errors::Result;

/// A pre-built package definition.
#[derive(Debug, Clone)]
pub enum PackageDefinition {
    /// An already-built pool.
    Pool(DescriptorPool),
    /// An encoded `FileDescriptorSet`, e.g. produced by `protoc --descriptor_set_out`.
    Encoded(Bytes),
}

impl From<DescriptorPool> for PackageDefinition {
    fn from(pool: DescriptorPool) -> Self {
        Self::Pool(pool)
    }
}

/// Where service definitions are loaded from.
#[derive(Debug, Clone)]
pub enum ProtoSource {
    /// `.proto` files compiled on `listen`.
    Files {
        /// Files to compile.
        paths: Vec<PathBuf>,
        /// Extra import search paths.
        include_dirs: Vec<PathBuf>,
    },
    /// A pre-built definition.
    Definition(PackageDefinition),
}

impl ProtoSource {
    /// Pick the source from `options` and an optional pre-built definition.
    /// Both or neither is a configuration error.
    pub fn select(
        options: &GrpcOptions,
        definition: Option<PackageDefinition>,
    ) -> std::result::Result<Self, TransportError> {
        match (options.proto_path.is_empty(), definition) {
            (false, Some(_)) => Err(TransportError::config(
                "protoPath and packageDefinition are mutually exclusive",
            )),
            (true, None) => Err(TransportError::config(
                "either protoPath or packageDefinition is required",
            )),
            (true, Some(definition)) => Ok(Self::Definition(definition)),
            (false, None) => Ok(Self::Files {
                paths: options.proto_path.clone(),
                include_dirs: options.loader.include_dirs.clone(),
            }),
        }
    }

    /// Load the definitions.
    pub fn load(&self) -> Result<DescriptorPool> {
        match self {
            Self::Files {
                paths,
                include_dirs,
            } => compile(paths, include_dirs),
            Self::Definition(PackageDefinition::Pool(pool)) => Ok(pool.clone()),
            Self::Definition(PackageDefinition::Encoded(bytes)) => {
                Ok(DescriptorPool::decode(bytes.clone())?)
            }
        }
    }
}

/// Compile `paths`. Each file's own directory is searched for imports after
/// `include_dirs`.
fn compile(paths: &[PathBuf], include_dirs: &[PathBuf]) -> Result<DescriptorPool> {
    let mut includes: Vec<PathBuf> = include_dirs.to_vec();
    for path in paths {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !includes.contains(&dir) {
            includes.push(dir);
        }
    }

    let mut compiler = protox::Compiler::new(&includes)?;
    let _ = compiler.include_imports(true);
    let _ = compiler.open_files(paths)?;
    let pool = compiler.descriptor_pool();
    debug!(
        files = paths.len(),
        services = pool.services().count(),
        "proto definitions compiled"
    );
    Ok(pool)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) const HERO_PROTO: &str = r#"
syntax = "proto3";
package hero;

service HeroService {
  rpc FindOne (HeroById) returns (Hero);
  rpc FindMany (stream HeroById) returns (stream Hero);
  rpc Countdown (Count) returns (stream Count);
  rpc Sum (stream Count) returns (Count);
}

message HeroById {
  int32 id = 1;
}

message Hero {
  int32 id = 1;
  string name = 2;
}

message Count {
  int32 value = 1;
}
"#;

    /// Write `source` as `name` into a fresh temp dir.
    pub(crate) fn write_proto(name: &str, source: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, source).unwrap();
        (dir, path)
    }

    pub(crate) fn hero_pool() -> DescriptorPool {
        let (_dir, path) = write_proto("hero.proto", HERO_PROTO);
        compile(&[path], &[]).unwrap()
    }
}
