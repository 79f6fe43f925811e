use super::store::{ScheduleStore, Show};
use crate::errors::{MatrixError, Result};
use chrono::{Duration, NaiveDateTime};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::VecDeque;

/// How the next show is picked when filling a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FillStrategy {
    /// Cycle through the shows in order
    #[default]
    RoundRobin,
    /// Random, avoiding the last few shows aired
    SmartRandom,
    /// Random, longer shows more likely
    WeightedRandom,
    /// Every show once, then stop
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedSlot {
    pub show_id: i64,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FillReport {
    pub planned: usize,
    pub created: usize,
    pub skipped_conflicts: usize,
}

pub struct AutoScheduler {
    strategy: FillStrategy,
    rng: StdRng,
}

impl AutoScheduler {
    pub fn new(strategy: FillStrategy) -> Self {
        Self {
            strategy,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic picks, for tests and reproducible fills
    pub fn with_seed(strategy: FillStrategy, seed: u64) -> Self {
        Self {
            strategy,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Lay shows back to back across `[start, end)`.
    ///
    /// Stops at the first show that would run past `end`.
    pub fn plan(&mut self, shows: &[Show], start: NaiveDateTime, end: NaiveDateTime) -> Vec<PlannedSlot> {
        let shows: Vec<&Show> = shows.iter().filter(|s| s.duration_minutes > 0).collect();
        let mut planned = Vec::new();
        if shows.is_empty() || end <= start {
            return planned;
        }

        let mut picker = Picker::new(self.strategy, &shows);
        let mut cursor = start;

        while cursor < end {
            let Some(idx) = picker.next(&mut self.rng) else {
                break;
            };
            let show = shows[idx];
            let Some(slot_end) = Duration::try_minutes(show.duration_minutes)
                .and_then(|d| cursor.checked_add_signed(d))
                .filter(|slot_end| *slot_end <= end)
            else {
                break;
            };
            planned.push(PlannedSlot {
                show_id: show.id,
                start: cursor,
                end: slot_end,
            });
            cursor = slot_end;
        }
        planned
    }

    /// Fill a stored schedule's window with `shows` (the whole library when
    /// `None`). Slots that clash with existing ones are skipped.
    pub fn fill_schedule(
        &mut self,
        store: &ScheduleStore,
        schedule_id: i64,
        shows: Option<Vec<Show>>,
    ) -> Result<FillReport> {
        let schedule = store.get_schedule(schedule_id)?;
        let shows = match shows {
            Some(s) => s,
            None => store.list_shows()?,
        };
        if shows.is_empty() {
            return Err(MatrixError::InvalidInput("no shows to schedule".into()));
        }

        let plan = self.plan(&shows, schedule.start, schedule.end);
        let mut report = FillReport {
            planned: plan.len(),
            ..Default::default()
        };

        for slot in &plan {
            match store.add_time_slot(schedule_id, slot.show_id, slot.start, slot.end) {
                Ok(_) => report.created += 1,
                Err(MatrixError::Conflict { .. }) => report.skipped_conflicts += 1,
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            schedule_id,
            strategy = ?self.strategy,
            created = report.created,
            skipped = report.skipped_conflicts,
            "auto-filled schedule"
        );
        Ok(report)
    }
}

struct Picker {
    strategy: FillStrategy,
    count: usize,
    position: usize,
    recent: VecDeque<usize>,
    window: usize,
    weights: Option<WeightedIndex<i64>>,
}

impl Picker {
    fn new(strategy: FillStrategy, shows: &[&Show]) -> Self {
        let count = shows.len();
        let weights = match strategy {
            FillStrategy::WeightedRandom => {
                WeightedIndex::new(shows.iter().map(|s| s.duration_minutes)).ok()
            }
            _ => None,
        };
        Self {
            strategy,
            count,
            position: 0,
            recent: VecDeque::new(),
            window: count.saturating_sub(1).min(3),
            weights,
        }
    }

    fn next(&mut self, rng: &mut StdRng) -> Option<usize> {
        match self.strategy {
            FillStrategy::RoundRobin => {
                let idx = self.position % self.count;
                self.position += 1;
                Some(idx)
            }
            FillStrategy::Sequential => {
                let idx = (self.position < self.count).then_some(self.position);
                self.position += 1;
                idx
            }
            FillStrategy::SmartRandom => {
                let candidates: Vec<usize> =
                    (0..self.count).filter(|i| !self.recent.contains(i)).collect();
                let idx = candidates[rng.gen_range(0..candidates.len())];
                if self.window > 0 {
                    self.recent.push_back(idx);
                    if self.recent.len() > self.window {
                        self.recent.pop_front();
                    }
                }
                Some(idx)
            }
            FillStrategy::WeightedRandom => match &self.weights {
                Some(w) => Some(w.sample(rng)),
                None => Some(rng.gen_range(0..self.count)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::store::NewShow;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn show(id: i64, minutes: i64) -> Show {
        Show {
            id,
            title: format!("Show {}", id),
            duration_minutes: minutes,
            genre: None,
            description: None,
            url: None,
        }
    }

    #[test]
    fn test_round_robin_cycles_and_stops_before_overrun() {
        let shows = vec![show(1, 30), show(2, 60)];
        let plan = AutoScheduler::new(FillStrategy::RoundRobin).plan(&shows, at(10, 0), at(12, 45));
        let ids: Vec<i64> = plan.iter().map(|p| p.show_id).collect();
        // 10:00-10:30, 10:30-11:30, 11:30-12:00; show 2 would end at 13:00
        assert_eq!(ids, vec![1, 2, 1]);
        assert_eq!(plan.last().unwrap().end, at(12, 0));
        assert!(plan.windows(2).all(|w| w[0].end == w[1].start));
    }

    #[test]
    fn test_oversized_show_stops_the_plan() {
        let shows = vec![show(1, 30), show(2, 200_000_000_000), show(3, i64::MAX)];
        let plan = AutoScheduler::new(FillStrategy::RoundRobin).plan(&shows, at(10, 0), at(12, 0));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].show_id, 1);

        let late = NaiveDateTime::MAX - Duration::minutes(10);
        let plan = AutoScheduler::new(FillStrategy::RoundRobin).plan(&[show(1, 60)], late, NaiveDateTime::MAX);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_sequential_airs_each_show_once() {
        let shows = vec![show(1, 30), show(2, 30), show(3, 30)];
        let plan = AutoScheduler::new(FillStrategy::Sequential).plan(&shows, at(0, 0), at(23, 0));
        assert_eq!(plan.iter().map(|p| p.show_id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_smart_random_never_repeats_recent_shows() {
        let shows: Vec<Show> = (1..=5).map(|i| show(i, 10)).collect();
        let plan = AutoScheduler::with_seed(FillStrategy::SmartRandom, 7).plan(&shows, at(0, 0), at(20, 0));
        assert_eq!(plan.len(), 120);
        for w in plan.windows(4) {
            let ids: std::collections::HashSet<i64> = w.iter().map(|p| p.show_id).collect();
            assert_eq!(ids.len(), 4, "repeat within window: {:?}", w);
        }

        let two = vec![show(1, 10), show(2, 10)];
        let plan = AutoScheduler::with_seed(FillStrategy::SmartRandom, 1).plan(&two, at(0, 0), at(2, 0));
        assert!(plan.windows(2).all(|w| w[0].show_id != w[1].show_id));
    }

    #[test]
    fn test_weighted_random_is_seeded() {
        let shows = vec![show(1, 5), show(2, 120)];
        let a = AutoScheduler::with_seed(FillStrategy::WeightedRandom, 42).plan(&shows, at(0, 0), at(23, 0));
        let b = AutoScheduler::with_seed(FillStrategy::WeightedRandom, 42).plan(&shows, at(0, 0), at(23, 0));
        assert_eq!(a, b);
        assert!(a.iter().all(|p| p.end <= at(23, 0)));
    }

    #[test]
    fn test_fill_schedule_skips_conflicts() {
        let store = ScheduleStore::open_in_memory().unwrap();
        let ch = store.add_channel("Retro", None).unwrap();
        let sched = store.create_schedule("Morning", ch, at(6, 0), at(8, 0)).unwrap();
        let news = store.add_show(&NewShow::new("News", 30)).unwrap();
        store.add_time_slot(sched, news, at(6, 30), at(7, 0)).unwrap();

        let report = AutoScheduler::new(FillStrategy::RoundRobin)
            .fill_schedule(&store, sched, None)
            .unwrap();
        assert_eq!(report, FillReport { planned: 4, created: 3, skipped_conflicts: 1 });
        assert_eq!(store.slots_for_schedule(sched).unwrap().len(), 4);
    }

    #[test]
    fn test_fill_without_shows_is_an_error() {
        let store = ScheduleStore::open_in_memory().unwrap();
        let ch = store.add_channel("Retro", None).unwrap();
        let sched = store.create_schedule("Empty", ch, at(6, 0), at(8, 0)).unwrap();
        assert!(AutoScheduler::new(FillStrategy::Sequential)
            .fill_schedule(&store, sched, None)
            .is_err());
    }
}
