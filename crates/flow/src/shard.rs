// Archivo: shard.rs
// Propósito: enrutamiento determinista de flujos a shards (prefijo del
// SHA-256 del id) y el conjunto de shards que posee este worker.
use std::collections::BTreeSet;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::FlowId;
use crate::errors::{FlowError, Result};

pub const DEFAULT_SHARD_PREFIX_LEN: usize = 2;
pub const MAX_SHARD_PREFIX_LEN: usize = 4;

/// Prefijo hexadecimal (minúsculas) de longitud fija que identifica un shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Valida un prefijo textual contra la longitud configurada.
    pub fn parse(raw: &str, prefix_len: usize) -> Result<Self> {
        let s = raw.trim().to_ascii_lowercase();
        if s.len() != prefix_len || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FlowError::Validation(format!("shard '{}' no es un prefijo hex de {} caracteres", raw, prefix_len)));
        }
        Ok(ShardId(s))
    }

    fn from_index(index: u64, prefix_len: usize) -> Self {
        ShardId(format!("{:0width$x}", index, width = prefix_len))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Valor numérico del prefijo, usado para rangos.
    pub fn index(&self) -> u64 {
        u64::from_str_radix(&self.0, 16).unwrap_or(0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Función pura `flow_id -> shard`. Todos los workers deben usar la misma
/// longitud de prefijo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    prefix_len: usize,
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self { prefix_len: DEFAULT_SHARD_PREFIX_LEN }
    }
}

impl ShardRouter {
    pub fn new(prefix_len: usize) -> Result<Self> {
        if prefix_len == 0 || prefix_len > MAX_SHARD_PREFIX_LEN {
            return Err(FlowError::Validation(format!("shard_prefix_len debe estar en 1..={} (recibido {})", MAX_SHARD_PREFIX_LEN, prefix_len)));
        }
        Ok(Self { prefix_len })
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn shard_count(&self) -> u64 {
        16u64.pow(self.prefix_len as u32)
    }

    /// Primeros `prefix_len` caracteres hex del SHA-256 de la representación
    /// textual canónica (con guiones, minúsculas) del id.
    pub fn shard_of(&self, flow_id: &FlowId) -> ShardId {
        let mut hasher = Sha256::new();
        hasher.update(flow_id.hyphenated().to_string().as_bytes());
        let hex = format!("{:x}", hasher.finalize());
        ShardId(hex[..self.prefix_len].to_string())
    }

    pub fn all_shards(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..self.shard_count()).map(move |i| ShardId::from_index(i, self.prefix_len))
    }
}

/// Conjunto de shards asignado a un worker.
///
/// Formatos textuales aceptados por [`ShardSet::parse`]: `all`, un rango
/// inclusivo `00-7f` o una lista `00,1a,ff`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardSet {
    All,
    Range { start: ShardId, end: ShardId },
    Explicit(BTreeSet<ShardId>),
}

impl ShardSet {
    pub fn parse(raw: &str, prefix_len: usize) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("all") {
            return Ok(ShardSet::All);
        }
        if let Some((a, b)) = raw.split_once('-') {
            let start = ShardId::parse(a, prefix_len)?;
            let end = ShardId::parse(b, prefix_len)?;
            if start.index() > end.index() {
                return Err(FlowError::Validation(format!("rango de shards invertido: {}", raw)));
            }
            return Ok(ShardSet::Range { start, end });
        }
        let mut set = BTreeSet::new();
        for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
            set.insert(ShardId::parse(part, prefix_len)?);
        }
        Ok(ShardSet::Explicit(set))
    }

    pub fn contains(&self, shard: &ShardId) -> bool {
        match self {
            ShardSet::All => true,
            ShardSet::Range { start, end } => {
                let i = shard.index();
                i >= start.index() && i <= end.index()
            }
            ShardSet::Explicit(set) => set.contains(shard),
        }
    }

    /// Enumera los shards concretos del conjunto según el router.
    pub fn shards(&self, router: &ShardRouter) -> BTreeSet<ShardId> {
        router.all_shards().filter(|s| self.contains(s)).collect()
    }
}

impl fmt::Display for ShardSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardSet::All => f.write_str("all"),
            ShardSet::Range { start, end } => write!(f, "{}-{}", start, end),
            ShardSet::Explicit(set) => {
                let parts: Vec<&str> = set.iter().map(|s| s.as_str()).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Propiedad de shards de este worker. Se reemplaza completa en un
/// rebalanceo.
#[derive(Debug)]
pub struct ShardOwnership {
    owned: RwLock<ShardSet>,
}

impl ShardOwnership {
    pub fn new(set: ShardSet) -> Self {
        Self { owned: RwLock::new(set) }
    }

    pub fn owns(&self, shard: &ShardId) -> bool {
        match self.owned.read() {
            Ok(g) => g.contains(shard),
            Err(p) => p.into_inner().contains(shard),
        }
    }

    pub fn snapshot(&self) -> ShardSet {
        match self.owned.read() {
            Ok(g) => g.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    /// Sustituye el conjunto y devuelve el anterior.
    pub fn replace(&self, set: ShardSet) -> ShardSet {
        let mut guard = match self.owned.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        std::mem::replace(&mut *guard, set)
    }
}
