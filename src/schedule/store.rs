use crate::channel::Channel;
use crate::errors::{MatrixError, Result};
use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// DATA TYPES
// ============================================================================

/// A broadcast channel in the scheduler (not a playlist entry)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleChannel {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub id: i64,
    pub title: String,
    pub duration_minutes: i64,
    pub genre: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewShow {
    pub title: String,
    pub duration_minutes: i64,
    pub genre: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
}

impl NewShow {
    pub fn new(title: impl Into<String>, duration_minutes: i64) -> Self {
        Self {
            title: title.into(),
            duration_minutes,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub channel_id: i64,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleSummary {
    #[serde(flatten)]
    pub schedule: Schedule,
    pub channel_name: String,
    pub slot_count: usize,
}

/// A show airing on a channel over `[start, end)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: i64,
    pub schedule_id: i64,
    pub channel_id: i64,
    pub show_id: i64,
    pub show_title: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeSlot {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConflictResolution {
    pub truncated: usize,
    pub removed: usize,
}

// ============================================================================
// DATABASE SCHEMA (SQLite)
// ============================================================================

const SCHEMA: &str = r#"
-- Broadcast channels
CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);

-- Show library
CREATE TABLE IF NOT EXISTS shows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL CHECK (duration_minutes > 0),
    genre TEXT,
    description TEXT,
    url TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_shows_title ON shows(title);

-- Schedules (a programming window on one channel)
CREATE TABLE IF NOT EXISTS schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Time slots, half-open [start_time, end_time)
CREATE TABLE IF NOT EXISTS time_slots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER NOT NULL REFERENCES schedules(id) ON DELETE CASCADE,
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    show_id INTEGER NOT NULL REFERENCES shows(id) ON DELETE CASCADE,
    start_time TEXT NOT NULL,
    end_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_slots_channel_time ON time_slots(channel_id, start_time);
CREATE INDEX IF NOT EXISTS idx_slots_schedule ON time_slots(schedule_id, start_time);
"#;

/// Longest show the library accepts: one week
pub const MAX_SHOW_MINUTES: i64 = 7 * 24 * 60;

fn check_duration(minutes: i64) -> Result<()> {
    if minutes <= 0 || minutes > MAX_SHOW_MINUTES {
        return Err(MatrixError::InvalidInput(format!(
            "show duration must be between 1 and {} minutes, got {}",
            MAX_SHOW_MINUTES, minutes
        )));
    }
    Ok(())
}

const SLOT_COLUMNS: &str = "ts.id, ts.schedule_id, ts.channel_id, ts.show_id, s.title, ts.start_time, ts.end_time";

fn row_to_slot(row: &Row<'_>) -> rusqlite::Result<TimeSlot> {
    Ok(TimeSlot {
        id: row.get(0)?,
        schedule_id: row.get(1)?,
        channel_id: row.get(2)?,
        show_id: row.get(3)?,
        show_title: row.get(4)?,
        start: row.get(5)?,
        end: row.get(6)?,
    })
}

fn row_to_show(row: &Row<'_>) -> rusqlite::Result<Show> {
    Ok(Show {
        id: row.get(0)?,
        title: row.get(1)?,
        duration_minutes: row.get(2)?,
        genre: row.get(3)?,
        description: row.get(4)?,
        url: row.get(5)?,
    })
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        channel_id: row.get(2)?,
        start: row.get(3)?,
        end: row.get(4)?,
    })
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn format_time(t: NaiveDateTime) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

// ============================================================================
// STORE
// ============================================================================

/// SQLite-backed schedule database.
///
/// Every statement goes through one mutex, so a conflict check and the write
/// that follows it can't interleave with another writer.
pub struct ScheduleStore {
    conn: Mutex<Connection>,
}

impl ScheduleStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        tracing::debug!(path = %db_path.display(), "opened schedule database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    /// Insert a channel, or return the id of the existing one with that name
    pub fn add_channel(&self, name: &str, description: Option<&str>) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MatrixError::InvalidInput("channel name is empty".into()));
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO channels (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, now()],
        )?;
        let id = conn.query_row("SELECT id FROM channels WHERE name = ?1", params![name], |r| {
            r.get(0)
        })?;
        Ok(id)
    }

    pub fn list_channels(&self) -> Result<Vec<ScheduleChannel>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, description, created_at FROM channels ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(ScheduleChannel {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn find_channel(&self, name: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let id = conn
            .query_row(
                "SELECT id FROM channels WHERE name = ?1 COLLATE NOCASE",
                params![name.trim()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn delete_channel(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM channels WHERE id = ?1", params![id])? == 0 {
            return Err(MatrixError::NotFound(format!("Channel {}", id)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shows
    // ------------------------------------------------------------------

    pub fn add_show(&self, show: &NewShow) -> Result<i64> {
        if show.title.trim().is_empty() {
            return Err(MatrixError::InvalidInput("show title is empty".into()));
        }
        check_duration(show.duration_minutes)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shows (title, duration_minutes, genre, description, url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                show.title.trim(),
                show.duration_minutes,
                show.genre,
                show.description,
                show.url,
                now()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_show(&self, id: i64) -> Result<Show> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, title, duration_minutes, genre, description, url FROM shows WHERE id = ?1",
            params![id],
            row_to_show,
        )
        .optional()?
        .ok_or_else(|| MatrixError::NotFound(format!("Show {}", id)))
    }

    pub fn list_shows(&self) -> Result<Vec<Show>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, duration_minutes, genre, description, url FROM shows ORDER BY id",
        )?;
        let shows = stmt.query_map([], row_to_show)?;
        Ok(shows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_show(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM shows WHERE id = ?1", params![id])? == 0 {
            return Err(MatrixError::NotFound(format!("Show {}", id)));
        }
        Ok(())
    }

    /// Turn playlist entries into shows of `duration_minutes` each, skipping
    /// titles already in the library. Returns how many were added.
    pub fn import_shows(&self, channels: &[Channel], duration_minutes: i64) -> Result<usize> {
        check_duration(duration_minutes)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut exists = tx.prepare("SELECT 1 FROM shows WHERE title = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO shows (title, duration_minutes, genre, url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for ch in channels {
                if exists.exists(params![ch.name])? {
                    continue;
                }
                insert.execute(params![ch.name, duration_minutes, ch.group, ch.url, now()])?;
                added += 1;
            }
        }
        tx.commit()?;
        tracing::info!(added, total = channels.len(), "imported shows from playlist");
        Ok(added)
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    pub fn create_schedule(
        &self,
        name: &str,
        channel_id: i64,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<i64> {
        if end <= start {
            return Err(MatrixError::InvalidInput(format!(
                "schedule end {} is not after start {}",
                format_time(end),
                format_time(start)
            )));
        }
        let conn = self.conn.lock();
        let channel_exists = conn
            .prepare("SELECT 1 FROM channels WHERE id = ?1")?
            .exists(params![channel_id])?;
        if !channel_exists {
            return Err(MatrixError::NotFound(format!("Channel {}", channel_id)));
        }
        conn.execute(
            "INSERT INTO schedules (name, channel_id, start_time, end_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, channel_id, start, end, now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_schedule(&self, id: i64) -> Result<Schedule> {
        let conn = self.conn.lock();
        Self::get_schedule_locked(&conn, id)
    }

    fn get_schedule_locked(conn: &Connection, id: i64) -> Result<Schedule> {
        conn.query_row(
            "SELECT id, name, channel_id, start_time, end_time FROM schedules WHERE id = ?1",
            params![id],
            row_to_schedule,
        )
        .optional()?
        .ok_or_else(|| MatrixError::NotFound(format!("Schedule {}", id)))
    }

    pub fn list_schedules(&self) -> Result<Vec<ScheduleSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT sc.id, sc.name, sc.channel_id, sc.start_time, sc.end_time, c.name,
                    (SELECT COUNT(*) FROM time_slots ts WHERE ts.schedule_id = sc.id)
             FROM schedules sc
             JOIN channels c ON c.id = sc.channel_id
             ORDER BY sc.start_time, sc.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ScheduleSummary {
                schedule: row_to_schedule(row)?,
                channel_name: row.get(5)?,
                slot_count: row.get::<_, i64>(6)? as usize,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_schedule(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])? == 0 {
            return Err(MatrixError::NotFound(format!("Schedule {}", id)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Time slots
    // ------------------------------------------------------------------

    /// Slots in the same schedule and channel overlapping `[start, end)`
    pub fn find_conflicts(
        &self,
        schedule_id: i64,
        start: NaiveDateTime,
        end: NaiveDateTime,
        exclude_slot: Option<i64>,
    ) -> Result<Vec<TimeSlot>> {
        let conn = self.conn.lock();
        let schedule = Self::get_schedule_locked(&conn, schedule_id)?;
        Self::conflicts_locked(&conn, &schedule, start, end, exclude_slot)
    }

    fn conflicts_locked(
        conn: &Connection,
        schedule: &Schedule,
        start: NaiveDateTime,
        end: NaiveDateTime,
        exclude_slot: Option<i64>,
    ) -> Result<Vec<TimeSlot>> {
        let sql = format!(
            "SELECT {} FROM time_slots ts JOIN shows s ON s.id = ts.show_id
             WHERE ts.schedule_id = ?1 AND ts.channel_id = ?2
               AND ts.start_time < ?4 AND ts.end_time > ?3
               AND ts.id != ?5
             ORDER BY ts.start_time",
            SLOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                schedule.id,
                schedule.channel_id,
                start,
                end,
                exclude_slot.unwrap_or(-1)
            ],
            row_to_slot,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Add a slot, refusing it if it overlaps an existing one
    pub fn add_time_slot(
        &self,
        schedule_id: i64,
        show_id: i64,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<i64> {
        self.insert_slot(schedule_id, show_id, start, end, true)
    }

    /// Add a slot without the overlap check, for importing external data.
    /// Run [`ScheduleStore::resolve_conflicts`] afterwards.
    pub fn add_time_slot_unchecked(
        &self,
        schedule_id: i64,
        show_id: i64,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<i64> {
        self.insert_slot(schedule_id, show_id, start, end, false)
    }

    fn insert_slot(
        &self,
        schedule_id: i64,
        show_id: i64,
        start: NaiveDateTime,
        end: NaiveDateTime,
        check_overlap: bool,
    ) -> Result<i64> {
        if end <= start {
            return Err(MatrixError::InvalidInput(format!(
                "slot end {} is not after start {}",
                format_time(end),
                format_time(start)
            )));
        }

        let conn = self.conn.lock();
        let schedule = Self::get_schedule_locked(&conn, schedule_id)?;

        if check_overlap {
            let conflicts = Self::conflicts_locked(&conn, &schedule, start, end, None)?;
            if !conflicts.is_empty() {
                return Err(MatrixError::Conflict {
                    start: format_time(start),
                    end: format_time(end),
                    count: conflicts.len(),
                });
            }
        }

        conn.execute(
            "INSERT INTO time_slots (schedule_id, channel_id, show_id, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![schedule.id, schedule.channel_id, show_id, start, end],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_slot(&self, id: i64) -> Result<TimeSlot> {
        let conn = self.conn.lock();
        Self::get_slot_locked(&conn, id)
    }

    fn get_slot_locked(conn: &Connection, id: i64) -> Result<TimeSlot> {
        let sql = format!(
            "SELECT {} FROM time_slots ts JOIN shows s ON s.id = ts.show_id WHERE ts.id = ?1",
            SLOT_COLUMNS
        );
        conn.query_row(&sql, params![id], row_to_slot)
            .optional()?
            .ok_or_else(|| MatrixError::NotFound(format!("Time slot {}", id)))
    }

    /// Move a slot to `new_start`, keeping its length
    pub fn move_slot(&self, slot_id: i64, new_start: NaiveDateTime) -> Result<()> {
        let conn = self.conn.lock();
        let slot = Self::get_slot_locked(&conn, slot_id)?;
        let new_end = new_start
            .checked_add_signed(slot.end - slot.start)
            .ok_or_else(|| {
                MatrixError::InvalidInput(format!(
                    "cannot move slot {} to {}",
                    slot_id,
                    format_time(new_start)
                ))
            })?;
        let schedule = Self::get_schedule_locked(&conn, slot.schedule_id)?;

        let conflicts = Self::conflicts_locked(&conn, &schedule, new_start, new_end, Some(slot_id))?;
        if !conflicts.is_empty() {
            return Err(MatrixError::Conflict {
                start: format_time(new_start),
                end: format_time(new_end),
                count: conflicts.len(),
            });
        }

        conn.execute(
            "UPDATE time_slots SET start_time = ?1, end_time = ?2 WHERE id = ?3",
            params![new_start, new_end, slot_id],
        )?;
        Ok(())
    }

    pub fn delete_slot(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        if conn.execute("DELETE FROM time_slots WHERE id = ?1", params![id])? == 0 {
            return Err(MatrixError::NotFound(format!("Time slot {}", id)));
        }
        Ok(())
    }

    pub fn slots_for_schedule(&self, schedule_id: i64) -> Result<Vec<TimeSlot>> {
        let conn = self.conn.lock();
        Self::slots_for_schedule_locked(&conn, schedule_id)
    }

    fn slots_for_schedule_locked(conn: &Connection, schedule_id: i64) -> Result<Vec<TimeSlot>> {
        let sql = format!(
            "SELECT {} FROM time_slots ts JOIN shows s ON s.id = ts.show_id
             WHERE ts.schedule_id = ?1 ORDER BY ts.start_time, ts.id",
            SLOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![schedule_id], row_to_slot)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Slots on a channel overlapping `[from, to)` across all schedules
    pub fn slots_in_window(
        &self,
        channel_id: i64,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<TimeSlot>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM time_slots ts JOIN shows s ON s.id = ts.show_id
             WHERE ts.channel_id = ?1 AND ts.start_time < ?3 AND ts.end_time > ?2
             ORDER BY ts.start_time, ts.id",
            SLOT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![channel_id, from, to], row_to_slot)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// What is airing on a channel at `at`, and what comes after it
    pub fn now_and_next(
        &self,
        channel_id: i64,
        at: NaiveDateTime,
    ) -> Result<(Option<TimeSlot>, Option<TimeSlot>)> {
        let conn = self.conn.lock();
        let current_sql = format!(
            "SELECT {} FROM time_slots ts JOIN shows s ON s.id = ts.show_id
             WHERE ts.channel_id = ?1 AND ts.start_time <= ?2 AND ts.end_time > ?2
             ORDER BY ts.start_time DESC LIMIT 1",
            SLOT_COLUMNS
        );
        let current = conn
            .query_row(&current_sql, params![channel_id, at], row_to_slot)
            .optional()?;

        let next_sql = format!(
            "SELECT {} FROM time_slots ts JOIN shows s ON s.id = ts.show_id
             WHERE ts.channel_id = ?1 AND ts.start_time > ?2
             ORDER BY ts.start_time LIMIT 1",
            SLOT_COLUMNS
        );
        let next = conn
            .query_row(&next_sql, params![channel_id, at], row_to_slot)
            .optional()?;

        Ok((current, next))
    }

    /// Truncate each overlapping slot to end where the following one starts.
    /// Slots left with no length are deleted.
    pub fn resolve_conflicts(&self, schedule_id: i64) -> Result<ConflictResolution> {
        let mut conn = self.conn.lock();
        Self::get_schedule_locked(&conn, schedule_id)?;
        let slots = Self::slots_for_schedule_locked(&conn, schedule_id)?;

        let mut outcome = ConflictResolution::default();
        let tx = conn.transaction()?;
        let mut prev: Option<TimeSlot> = None;

        for slot in slots {
            if let Some(p) = prev.as_ref().filter(|p| p.end > slot.start) {
                if slot.start <= p.start {
                    tx.execute("DELETE FROM time_slots WHERE id = ?1", params![p.id])?;
                    outcome.removed += 1;
                } else {
                    tx.execute(
                        "UPDATE time_slots SET end_time = ?1 WHERE id = ?2",
                        params![slot.start, p.id],
                    )?;
                    outcome.truncated += 1;
                }
            }
            prev = Some(slot);
        }
        tx.commit()?;

        if outcome != ConflictResolution::default() {
            tracing::info!(
                schedule_id,
                truncated = outcome.truncated,
                removed = outcome.removed,
                "resolved schedule conflicts"
            );
        }
        Ok(outcome)
    }

    /// Schedule with its slots as pretty JSON
    pub fn export_schedule_json(&self, schedule_id: i64) -> Result<String> {
        #[derive(Serialize)]
        struct Export {
            schedule: Schedule,
            slots: Vec<TimeSlot>,
        }

        let conn = self.conn.lock();
        let export = Export {
            schedule: Self::get_schedule_locked(&conn, schedule_id)?,
            slots: Self::slots_for_schedule_locked(&conn, schedule_id)?,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn setup() -> (ScheduleStore, i64, i64) {
        let store = ScheduleStore::open_in_memory().unwrap();
        let ch = store.add_channel("Retro TV", None).unwrap();
        let sched = store.create_schedule("Friday", ch, at(0, 0), at(23, 59)).unwrap();
        (store, ch, sched)
    }

    #[test]
    fn test_add_channel_is_idempotent() {
        let store = ScheduleStore::open_in_memory().unwrap();
        let a = store.add_channel("Retro TV", Some("classics")).unwrap();
        let b = store.add_channel("Retro TV", None).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_channels().unwrap().len(), 1);
        assert_eq!(store.find_channel("retro tv").unwrap(), Some(a));
        assert!(store.add_channel("  ", None).is_err());
    }

    #[test]
    fn test_show_validation() {
        let store = ScheduleStore::open_in_memory().unwrap();
        assert!(matches!(
            store.add_show(&NewShow::new("Bad", 0)),
            Err(MatrixError::InvalidInput(_))
        ));
        assert!(matches!(
            store.add_show(&NewShow::new("Endless", 200_000_000_000)),
            Err(MatrixError::InvalidInput(_))
        ));
        assert!(store.add_show(&NewShow::new("Marathon", MAX_SHOW_MINUTES)).is_ok());
        assert!(store.import_shows(&[Channel::new("Huge", "http://a/h")], MAX_SHOW_MINUTES + 1).is_err());
        let id = store.add_show(&NewShow::new("Good", 30)).unwrap();
        assert_eq!(store.get_show(id).unwrap().duration_minutes, 30);
        assert!(matches!(store.get_show(999), Err(MatrixError::NotFound(_))));
    }

    #[test]
    fn test_overlapping_slot_is_rejected() {
        let (store, _, sched) = setup();
        let show = store.add_show(&NewShow::new("News", 30)).unwrap();
        store.add_time_slot(sched, show, at(10, 0), at(10, 30)).unwrap();

        let err = store.add_time_slot(sched, show, at(10, 15), at(10, 45)).unwrap_err();
        assert!(matches!(err, MatrixError::Conflict { count: 1, .. }));

        // Touching intervals don't overlap
        store.add_time_slot(sched, show, at(10, 30), at(11, 0)).unwrap();
        store.add_time_slot(sched, show, at(9, 30), at(10, 0)).unwrap();
        assert_eq!(store.slots_for_schedule(sched).unwrap().len(), 3);
    }

    #[test]
    fn test_move_slot_checks_conflicts_excluding_itself() {
        let (store, _, sched) = setup();
        let show = store.add_show(&NewShow::new("News", 30)).unwrap();
        let a = store.add_time_slot(sched, show, at(10, 0), at(10, 30)).unwrap();
        store.add_time_slot(sched, show, at(11, 0), at(11, 30)).unwrap();

        store.move_slot(a, at(10, 15)).unwrap();
        assert_eq!(store.get_slot(a).unwrap().end, at(10, 45));
        assert!(matches!(store.move_slot(a, at(10, 45)), Err(MatrixError::Conflict { .. })));
        assert!(matches!(
            store.move_slot(a, NaiveDateTime::MAX),
            Err(MatrixError::InvalidInput(_))
        ));
        assert!(matches!(store.move_slot(999, at(12, 0)), Err(MatrixError::NotFound(_))));
    }

    #[test]
    fn test_deletes_report_missing_rows() {
        let (store, ch, sched) = setup();
        let show = store.add_show(&NewShow::new("News", 30)).unwrap();
        let slot = store.add_time_slot(sched, show, at(10, 0), at(10, 30)).unwrap();

        store.delete_slot(slot).unwrap();
        assert!(matches!(store.delete_slot(slot), Err(MatrixError::NotFound(_))));
        store.delete_show(show).unwrap();
        assert!(matches!(store.delete_show(show), Err(MatrixError::NotFound(_))));
        store.delete_schedule(sched).unwrap();
        assert!(matches!(store.delete_schedule(sched), Err(MatrixError::NotFound(_))));
        store.delete_channel(ch).unwrap();
        assert!(matches!(store.delete_channel(ch), Err(MatrixError::NotFound(_))));
        assert!(store.list_channels().unwrap().is_empty());
    }

    #[test]
    fn test_deletes_cascade_to_dependents() {
        let (store, ch, sched) = setup();
        let news = store.add_show(&NewShow::new("News", 30)).unwrap();
        let film = store.add_show(&NewShow::new("Film", 90)).unwrap();
        store.add_time_slot(sched, news, at(10, 0), at(10, 30)).unwrap();
        store.add_time_slot(sched, film, at(11, 0), at(12, 30)).unwrap();

        // Dropping a show removes its slots only
        store.delete_show(news).unwrap();
        let slots = store.slots_for_schedule(sched).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].show_id, film);

        // Dropping the channel takes its schedules and their slots along
        let other = store.create_schedule("Saturday", ch, at(0, 0), at(6, 0)).unwrap();
        store.add_time_slot(other, film, at(1, 0), at(2, 30)).unwrap();
        store.delete_channel(ch).unwrap();
        assert!(store.list_schedules().unwrap().is_empty());
        assert!(store.slots_for_schedule(sched).unwrap().is_empty());
        assert!(store.slots_for_schedule(other).unwrap().is_empty());
        assert_eq!(store.list_shows().unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_conflicts_truncates_and_removes() {
        let (store, _, sched) = setup();
        let show = store.add_show(&NewShow::new("Film", 90)).unwrap();
        let first = store.add_time_slot_unchecked(sched, show, at(8, 0), at(9, 30)).unwrap();
        let dup = store.add_time_slot_unchecked(sched, show, at(9, 0), at(10, 0)).unwrap();
        store.add_time_slot_unchecked(sched, show, at(9, 0), at(9, 45)).unwrap();

        let outcome = store.resolve_conflicts(sched).unwrap();
        assert_eq!(outcome, ConflictResolution { truncated: 1, removed: 1 });

        let slots = store.slots_for_schedule(sched).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].id, first);
        assert_eq!(slots[0].end, at(9, 0));
        assert!(slots.iter().all(|s| s.id != dup));
        assert!(slots.windows(2).all(|w| w[0].end <= w[1].start));
    }

    #[test]
    fn test_now_and_next() {
        let (store, ch, sched) = setup();
        let show = store.add_show(&NewShow::new("News", 30)).unwrap();
        store.add_time_slot(sched, show, at(10, 0), at(10, 30)).unwrap();
        store.add_time_slot(sched, show, at(11, 0), at(11, 30)).unwrap();

        let (now, next) = store.now_and_next(ch, at(10, 10)).unwrap();
        assert_eq!(now.unwrap().start, at(10, 0));
        assert_eq!(next.unwrap().start, at(11, 0));

        let (now, next) = store.now_and_next(ch, at(10, 30)).unwrap();
        assert!(now.is_none());
        assert!(next.is_some());

        assert_eq!(store.slots_in_window(ch, at(10, 20), at(11, 5)).unwrap().len(), 2);
    }

    #[test]
    fn test_schedule_summary_and_export() {
        let (store, ch, sched) = setup();
        let show = store.add_show(&NewShow::new("News", 30)).unwrap();
        store.add_time_slot(sched, show, at(10, 0), at(10, 30)).unwrap();

        let summaries = store.list_schedules().unwrap();
        assert_eq!(summaries[0].slot_count, 1);
        assert_eq!(summaries[0].channel_name, "Retro TV");

        let json: serde_json::Value =
            serde_json::from_str(&store.export_schedule_json(sched).unwrap()).unwrap();
        assert_eq!(json["slots"][0]["show_title"], "News");
        assert_eq!(json["schedule"]["channel_id"], ch);

        assert!(store.create_schedule("Bad", ch, at(5, 0), at(5, 0)).is_err());
        assert!(matches!(
            store.create_schedule("Orphan", 42, at(5, 0), at(6, 0)),
            Err(MatrixError::NotFound(_))
        ));
    }

    #[test]
    fn test_import_shows_skips_existing_titles() {
        let store = ScheduleStore::open_in_memory().unwrap();
        let channels = vec![
            Channel::new("Cartoons", "http://a/1"),
            Channel::new("Movies", "http://a/2"),
        ];
        assert_eq!(store.import_shows(&channels, 30).unwrap(), 2);
        assert_eq!(store.import_shows(&channels, 30).unwrap(), 0);
        let shows = store.list_shows().unwrap();
        assert_eq!(shows[1].url.as_deref(), Some("http://a/2"));
    }
}
