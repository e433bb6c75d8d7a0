// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bounded, per-team message storage: a JSONL hot file plus a directory of
//! gzip archives, with age/size eviction (§4.5). Single-writer per team;
//! the spec leaves atomicity to the implementer where the host OS can't
//! guarantee in-place append-with-truncate safety, so writes here always go
//! through a temp-file-then-rename.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use fs4::FileExt;

use crate::config::TeamRuntimeConfig;
use crate::error::StorageError;
use crate::message::TeamMessage;

pub struct MessageStore {
    root: PathBuf,
    config: Arc<TeamRuntimeConfig>,
}

struct ArchiveFile {
    path: PathBuf,
    created_ms: i64,
    size: u64,
}

impl MessageStore {
    /// `root` is the conventional per-user home root (`teams/<team-id>/...`
    /// lives under it); the caller resolves that path (dirs::home_dir() or
    /// an override), storage itself takes no position on where home is.
    pub fn new(root: PathBuf, config: Arc<TeamRuntimeConfig>) -> Self {
        Self { root, config }
    }

    fn team_dir(&self, team: &str) -> PathBuf {
        self.root.join("teams").join(team)
    }

    fn hot_path(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("messages.jsonl")
    }

    fn archive_dir(&self, team: &str) -> PathBuf {
        self.team_dir(team).join("archives")
    }

    fn lock_path(&self, team: &str) -> PathBuf {
        self.team_dir(team).join(".lock")
    }

    /// Hold an exclusive file lock across a team's read-modify-write
    /// section. Guards against a second OS process touching the same
    /// `~/.../teams/<team>/` tree concurrently — in-process callers are
    /// already serialized by the Session Runtime's single-writer
    /// discipline, but the hot file itself makes no such promise across
    /// processes.
    fn with_team_lock<T>(
        &self,
        team: &str,
        f: impl FnOnce() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let dir = self.team_dir(team);
        std::fs::create_dir_all(&dir)?;
        let lock_file = File::create(self.lock_path(team))?;
        lock_file.lock_exclusive()?;
        let result = f();
        let _ = lock_file.unlock();
        result
    }

    /// Append one record and enforce limits. Idempotent by id: saving the
    /// same message twice is a no-op the second time.
    pub fn save(&self, team: &str, msg: TeamMessage) -> Result<(), StorageError> {
        self.with_team_lock(team, || {
            let mut records = self.read_hot(team)?;
            if !records.iter().any(|m| m.id == msg.id) {
                records.push(msg.clone());
            }
            records.sort_by_key(|m| m.timestamp);
            self.write_hot(team, &records)?;
            self.enforce_limits(team, crate::now_ms())
        })
    }

    /// Merge a remote batch by id, ordered by timestamp ascending.
    /// `hydrate(r); hydrate(r)` is a no-op the second time (idempotent).
    pub fn hydrate(&self, team: &str, remote: Vec<TeamMessage>) -> Result<(), StorageError> {
        self.with_team_lock(team, || {
            let mut records = self.read_hot(team)?;
            for m in &remote {
                if !records.iter().any(|r| r.id == m.id) {
                    records.push(m.clone());
                }
            }
            records.sort_by_key(|m| m.timestamp);
            self.write_hot(team, &records)?;
            self.enforce_limits(team, crate::now_ms())
        })
    }

    /// Newest-first page with a `has_more` flag. `before` excludes records
    /// at or after that timestamp.
    pub fn get(
        &self,
        team: &str,
        limit: usize,
        before: Option<i64>,
    ) -> Result<(Vec<TeamMessage>, bool), StorageError> {
        let mut records = self.read_hot(team)?;
        records.sort_by_key(|m| m.timestamp);
        if let Some(before) = before {
            records.retain(|m| m.timestamp < before);
        }
        let has_more = records.len() > limit;
        let page: Vec<TeamMessage> = records.into_iter().rev().take(limit).collect();
        Ok((page, has_more))
    }

    /// Oldest-first slice of the latest `n` — ready for prompt ingestion.
    pub fn recent_context(&self, team: &str, n: usize) -> Result<Vec<TeamMessage>, StorageError> {
        let mut records = self.read_hot(team)?;
        records.sort_by_key(|m| m.timestamp);
        if records.len() > n {
            let start = records.len() - n;
            records = records[start..].to_vec();
        }
        Ok(records)
    }

    fn read_hot(&self, team: &str) -> Result<Vec<TeamMessage>, StorageError> {
        let path = self.hot_path(team);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        let mut out = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TeamMessage>(line) {
                Ok(m) => out.push(m),
                Err(e) => {
                    tracing::warn!(team, line = i, error = %e, "skipping malformed message record")
                }
            }
        }
        Ok(out)
    }

    fn write_hot(&self, team: &str, records: &[TeamMessage]) -> Result<(), StorageError> {
        let dir = self.team_dir(team);
        std::fs::create_dir_all(&dir)?;
        let path = self.hot_path(team);
        let tmp_path = dir.join("messages.jsonl.tmp");
        let mut buf = String::new();
        for m in records {
            buf.push_str(&serde_json::to_string(m)?);
            buf.push('\n');
        }
        std::fs::write(&tmp_path, buf)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// The enforce-limits algorithm from §4.5, run after every `save` /
    /// `hydrate`: partition by age, cap the hot set, archive the overflow
    /// as one gzip fragment, then trim by archive count and total budget.
    fn enforce_limits(&self, team: &str, now: i64) -> Result<(), StorageError> {
        let mut records = self.read_hot(team)?;
        records.sort_by_key(|m| m.timestamp);

        let max_age_ms = self.config.max_age().num_milliseconds();
        let mut retained = Vec::new();
        let mut archived = Vec::new();
        for m in records.drain(..) {
            if now - m.timestamp > max_age_ms {
                archived.push(m);
            } else {
                retained.push(m);
            }
        }

        if retained.len() > self.config.hot_cap {
            let overflow = retained.len() - self.config.hot_cap;
            archived.extend(retained.drain(0..overflow));
        }
        archived.sort_by_key(|m| m.timestamp);

        self.write_hot(team, &retained)?;

        if !archived.is_empty() {
            self.write_archive(team, &archived, now)?;
        }

        self.enforce_archive_budget(team)?;
        Ok(())
    }

    fn write_archive(
        &self,
        team: &str,
        records: &[TeamMessage],
        now: i64,
    ) -> Result<(), StorageError> {
        let dir = self.archive_dir(team);
        std::fs::create_dir_all(&dir)?;
        let first_id = records
            .first()
            .map(|m| m.id.to_string())
            .unwrap_or_default();
        let path = dir.join(format!("{now}-{first_id}.jsonl.gz"));
        let file = std::fs::File::create(&path)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        for m in records {
            let line = serde_json::to_string(m)?;
            encoder.write_all(line.as_bytes())?;
            encoder.write_all(b"\n")?;
        }
        encoder.finish()?;
        Ok(())
    }

    fn list_archive_files(&self, team: &str) -> Result<Vec<ArchiveFile>, StorageError> {
        let dir = self.archive_dir(team);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(ms_str) = name.split('-').next() else {
                continue;
            };
            let Ok(created_ms) = ms_str.parse::<i64>() else {
                continue;
            };
            let size = entry.metadata()?.len();
            out.push(ArchiveFile {
                path,
                created_ms,
                size,
            });
        }
        Ok(out)
    }

    /// While archive file count exceeds the cap, delete the oldest; while
    /// total size (hot + archives) exceeds the per-team budget, delete the
    /// oldest archive. The hot file is never truncated beyond rule 2 of
    /// `enforce_limits`.
    fn enforce_archive_budget(&self, team: &str) -> Result<(), StorageError> {
        let mut files = self.list_archive_files(team)?;
        files.sort_by_key(|f| f.created_ms);

        while files.len() > self.config.max_archive_files {
            let oldest = files.remove(0);
            std::fs::remove_file(&oldest.path)?;
        }

        let hot_size = std::fs::metadata(self.hot_path(team))
            .map(|m| m.len())
            .unwrap_or(0);
        let mut total: u64 = hot_size + files.iter().map(|f| f.size).sum::<u64>();
        while total > self.config.team_budget_bytes && !files.is_empty() {
            let oldest = files.remove(0);
            total = total.saturating_sub(oldest.size);
            std::fs::remove_file(&oldest.path)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn archive_file_count(&self, team: &str) -> usize {
        self.list_archive_files(team).unwrap().len()
    }

    #[cfg(test)]
    fn archive_record_count(&self, team: &str) -> Result<usize, StorageError> {
        let mut total = 0;
        for f in self.list_archive_files(team)? {
            let file = std::fs::File::open(&f.path)?;
            let decoder = flate2::read::GzDecoder::new(file);
            use std::io::BufRead;
            total += std::io::BufReader::new(decoder).lines().count();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageTypeTag;

    fn store_with_config(config: TeamRuntimeConfig) -> (MessageStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::new(dir.path().to_path_buf(), Arc::new(config));
        (store, dir)
    }

    fn msg_at(team: &str, ts: i64) -> TeamMessage {
        TeamMessage::new(team, "hi", MessageTypeTag::Chat, "session-a", ts)
    }

    #[test]
    fn save_then_get_round_trips() {
        let (store, _dir) = store_with_config(TeamRuntimeConfig::default());
        let m = msg_at("team-a", 100);
        store.save("team-a", m.clone()).unwrap();
        let (page, has_more) = store.get("team-a", 10, None).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, m.id);
        assert!(!has_more);
    }

    #[test]
    fn save_is_idempotent_by_id() {
        let (store, _dir) = store_with_config(TeamRuntimeConfig::default());
        let m = msg_at("team-a", 100);
        store.save("team-a", m.clone()).unwrap();
        store.save("team-a", m).unwrap();
        let (page, _) = store.get("team-a", 10, None).unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn hydrate_twice_with_same_set_is_idempotent() {
        let (store, _dir) = store_with_config(TeamRuntimeConfig::default());
        let remote = vec![msg_at("team-a", 100), msg_at("team-a", 200)];
        store.hydrate("team-a", remote.clone()).unwrap();
        store.hydrate("team-a", remote).unwrap();
        let (page, _) = store.get("team-a", 10, None).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn get_returns_newest_first() {
        let (store, _dir) = store_with_config(TeamRuntimeConfig::default());
        store.save("team-a", msg_at("team-a", 100)).unwrap();
        store.save("team-a", msg_at("team-a", 300)).unwrap();
        store.save("team-a", msg_at("team-a", 200)).unwrap();
        let (page, _) = store.get("team-a", 10, None).unwrap();
        let timestamps: Vec<i64> = page.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![300, 200, 100]);
    }

    #[test]
    fn get_reports_has_more_when_truncated() {
        let (store, _dir) = store_with_config(TeamRuntimeConfig::default());
        for i in 0..5 {
            store.save("team-a", msg_at("team-a", i)).unwrap();
        }
        let (page, has_more) = store.get("team-a", 2, None).unwrap();
        assert_eq!(page.len(), 2);
        assert!(has_more);
    }

    #[test]
    fn recent_context_is_oldest_first_and_capped() {
        let (store, _dir) = store_with_config(TeamRuntimeConfig::default());
        for i in 0..5 {
            store.save("team-a", msg_at("team-a", i)).unwrap();
        }
        let recent = store.recent_context("team-a", 3).unwrap();
        let timestamps: Vec<i64> = recent.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3, 4]);
    }

    #[test]
    fn hot_cap_overflow_moves_oldest_into_archive() {
        let config = TeamRuntimeConfig {
            hot_cap: 5,
            ..Default::default()
        };
        let (store, _dir) = store_with_config(config);
        let now = crate::now_ms();
        for i in 0..8 {
            store.save("team-a", msg_at("team-a", now + i)).unwrap();
        }
        let (page, _) = store.get("team-a", 100, None).unwrap();
        assert_eq!(page.len(), 5);
        assert_eq!(store.archive_file_count("team-a"), 1);
        assert_eq!(store.archive_record_count("team-a").unwrap(), 3);
    }

    #[test]
    fn message_older_than_max_age_goes_directly_to_archive() {
        let config = TeamRuntimeConfig {
            max_age_days: 7,
            ..Default::default()
        };
        let (store, _dir) = store_with_config(config);
        let now = crate::now_ms();
        let eight_days_ago = now - chrono::Duration::days(8).num_milliseconds();
        store.save("team-a", msg_at("team-a", now)).unwrap();
        store.save("team-a", msg_at("team-a", eight_days_ago)).unwrap();
        let (page, _) = store.get("team-a", 100, None).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(store.archive_file_count("team-a"), 1);
    }

    #[test]
    fn archive_count_eviction_deletes_oldest_first() {
        let config = TeamRuntimeConfig {
            hot_cap: 1,
            max_archive_files: 2,
            ..Default::default()
        };
        let (store, _dir) = store_with_config(config);
        let now = crate::now_ms();
        // Each save with hot_cap=1 and 2 messages already present pushes one
        // message straight into its own archive file.
        for i in 0..4 {
            store.save("team-a", msg_at("team-a", now + i)).unwrap();
            store.save("team-a", msg_at("team-a", now + i + 100)).unwrap();
        }
        assert!(store.archive_file_count("team-a") <= 2);
    }

    #[test]
    fn concurrent_saves_from_two_threads_lose_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MessageStore::new(
            dir.path().to_path_buf(),
            Arc::new(TeamRuntimeConfig {
                hot_cap: 1000,
                ..Default::default()
            }),
        ));
        let store_a = store.clone();
        let store_b = store.clone();
        let a = std::thread::spawn(move || {
            for i in 0..50 {
                store_a.save("team-a", msg_at("team-a", i)).unwrap();
            }
        });
        let b = std::thread::spawn(move || {
            for i in 50..100 {
                store_b.save("team-a", msg_at("team-a", i)).unwrap();
            }
        });
        a.join().unwrap();
        b.join().unwrap();
        let (page, _) = store.get("team-a", 1000, None).unwrap();
        assert_eq!(page.len(), 100);
    }
}
