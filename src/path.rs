//! BIP32 paths as they travel through proposals (`m/48'/0'/0'/2'/0/7`).

use bitcoin::bip32::{ChildNumber, DerivationPath};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HdPath(Vec<ChildNumber>);

impl HdPath {
    pub fn master() -> Self {
        HdPath(Vec::new())
    }

    pub fn components(&self) -> &[ChildNumber] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &HdPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Components after `prefix`, if `prefix` is a prefix of this path.
    pub fn strip_prefix(&self, prefix: &HdPath) -> Option<&[ChildNumber]> {
        self.0.strip_prefix(prefix.0.as_slice())
    }

    pub fn child(&self, child: ChildNumber) -> Self {
        let mut path = self.0.clone();
        path.push(child);
        HdPath(path)
    }

    pub fn extend(&self, children: &[ChildNumber]) -> Self {
        let mut path = self.0.clone();
        path.extend_from_slice(children);
        HdPath(path)
    }

    /// Keeps this path when it already lives under `base`, otherwise treats it
    /// as relative to the key at `base` and appends it.
    pub fn rebase_onto(&self, base: &HdPath) -> Self {
        if self.starts_with(base) {
            self.clone()
        } else {
            base.extend(&self.0)
        }
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, init) = self.0.split_last()?;
        Some(HdPath(init.to_vec()))
    }

    /// Account level of an address path, i.e. the path without its
    /// `change/index` tail.
    pub fn account(&self) -> Result<Self> {
        if self.0.len() < 2 {
            return Err(Error::invalid_path(self.to_string(), "no change/index tail"));
        }
        Ok(HdPath(self.0[..self.0.len() - 2].to_vec()))
    }

    /// `(change, index)` of an address path.
    pub fn change_and_index(&self) -> Result<(u32, u32)> {
        match self.0.as_slice() {
            [.., change, index] => Ok((
                normal_index(*change, self)?,
                normal_index(*index, self)?,
            )),
            _ => Err(Error::invalid_path(self.to_string(), "no change/index tail")),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self.change_and_index(), Ok((0, _)))
    }

    /// Splits after the last hardened component: the key to ask the key store
    /// for, and the public tail to derive from it.
    pub fn split_hardened(&self) -> (HdPath, Vec<ChildNumber>) {
        let split = self
            .0
            .iter()
            .rposition(ChildNumber::is_hardened)
            .map(|pos| pos + 1)
            .unwrap_or(0);
        (HdPath(self.0[..split].to_vec()), self.0[split..].to_vec())
    }

    pub fn to_derivation_path(&self) -> DerivationPath {
        DerivationPath::from(self.0.clone())
    }
}

/// Non-hardened index values of `children`.
pub fn normal_indices(children: &[ChildNumber], path: &HdPath) -> Result<Vec<u32>> {
    children.iter().map(|c| normal_index(*c, path)).collect()
}

fn normal_index(child: ChildNumber, path: &HdPath) -> Result<u32> {
    match child {
        ChildNumber::Normal { index } => Ok(index),
        ChildNumber::Hardened { .. } => Err(Error::invalid_path(
            path.to_string(),
            "hardened step cannot be derived from a public key",
        )),
    }
}

impl FromStr for HdPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let mut parts = trimmed.split('/');
        match parts.next() {
            Some("m") | Some("M") => {}
            _ => return Err(Error::invalid_path(s, "path must start with m/")),
        }
        let mut children = Vec::new();
        for part in parts {
            let (digits, hardened) = match part
                .strip_suffix('\'')
                .or_else(|| part.strip_suffix('h'))
                .or_else(|| part.strip_suffix('H'))
            {
                Some(digits) => (digits, true),
                None => (part, false),
            };
            let index: u32 = digits
                .parse()
                .map_err(|_| Error::invalid_path(s, format!("bad component `{part}`")))?;
            let child = if hardened {
                ChildNumber::from_hardened_idx(index)
            } else {
                ChildNumber::from_normal_idx(index)
            }
            .map_err(|e| Error::invalid_path(s, e.to_string()))?;
            children.push(child);
        }
        Ok(HdPath(children))
    }
}

impl TryFrom<String> for HdPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HdPath> for String {
    fn from(path: HdPath) -> Self {
        path.to_string()
    }
}

impl From<&DerivationPath> for HdPath {
    fn from(path: &DerivationPath) -> Self {
        HdPath(path.as_ref().to_vec())
    }
}

impl From<Vec<ChildNumber>> for HdPath {
    fn from(children: Vec<ChildNumber>) -> Self {
        HdPath(children)
    }
}

impl fmt::Display for HdPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for child in &self.0 {
            match child {
                ChildNumber::Normal { index } => write!(f, "/{index}")?,
                ChildNumber::Hardened { index } => write!(f, "/{index}'")?,
            }
        }
        Ok(())
    }
}
