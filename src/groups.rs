//! Operator-local application groups.
//!
//! Groups live in an unsigned `groups` file at the repository root: one
//! `name\tid,id,...` line per group, name-sorted. They never enter the
//! signed tree; their only job is to warn when a batch updates part of a
//! group without the rest.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};

use repometa::AppId;

use crate::store::{RepoStore, GROUPS_FILE};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Groups {
    pub groups: BTreeMap<String, BTreeSet<AppId>>,
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty() && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
    if !ok {
        bail!("invalid group name {name:?}");
    }
    Ok(())
}

impl Groups {
    pub fn load(store: &RepoStore) -> Result<Self> {
        if !store.exists(GROUPS_FILE) {
            return Ok(Self::default());
        }
        let text = String::from_utf8(store.read(GROUPS_FILE)?).context("groups file is not valid UTF-8")?;

        let mut groups = BTreeMap::new();
        for line in text.lines() {
            let Some((name, members)) = line.split_once('\t') else {
                bail!("malformed groups line {line:?}");
            };
            validate_name(name)?;
            let mut ids = BTreeSet::new();
            for part in members.split(',').filter(|p| !p.is_empty()) {
                ids.insert(AppId::new(part).context(format!("bad member in group {name:?}"))?);
            }
            if groups.insert(name.to_string(), ids).is_some() {
                bail!("group {name:?} listed twice");
            }
        }
        Ok(Self {
            groups,
        })
    }

    pub fn save(&self, store: &RepoStore) -> Result<()> {
        let mut out = String::new();
        for (name, ids) in &self.groups {
            let members: Vec<&str> = ids.iter().map(AppId::as_str).collect();
            out.push_str(&format!("{name}\t{}\n", members.join(",")));
        }
        let w = store.stage(GROUPS_FILE, out.as_bytes())?;
        store.commit(&[w], &[])
    }

    pub fn create(&mut self, name: &str, ids: Vec<AppId>) -> Result<()> {
        validate_name(name)?;
        if self.groups.contains_key(name) {
            bail!("group {name:?} already exists");
        }
        self.groups.insert(name.to_string(), ids.into_iter().collect());
        Ok(())
    }

    pub fn add(&mut self, name: &str, ids: Vec<AppId>) -> Result<()> {
        let group = self.groups.get_mut(name).with_context(|| format!("no such group {name:?}"))?;
        group.extend(ids);
        Ok(())
    }

    pub fn remove(&mut self, name: &str, ids: &[AppId]) -> Result<()> {
        let group = self.groups.get_mut(name).with_context(|| format!("no such group {name:?}"))?;
        for id in ids {
            group.remove(id);
        }
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        if self.groups.remove(name).is_none() {
            bail!("no such group {name:?}");
        }
        Ok(())
    }

    /// Groups that a batch touches without covering: `(group, members the
    /// batch left out)`.
    pub fn partial_updates(&self, touched: &BTreeSet<AppId>) -> Vec<(String, Vec<AppId>)> {
        let mut partial = Vec::new();
        for (name, members) in &self.groups {
            if members.iter().any(|m| touched.contains(m)) {
                let missing: Vec<AppId> = members.iter().filter(|m| !touched.contains(*m)).cloned().collect();
                if !missing.is_empty() {
                    partial.push((name.clone(), missing));
                }
            }
        }
        partial
    }
}
