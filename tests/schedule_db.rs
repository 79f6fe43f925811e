use chrono::{NaiveDate, NaiveDateTime};
use m3u_matrix_lib::errors::MatrixError;
use m3u_matrix_lib::parser::parse_m3u;
use m3u_matrix_lib::schedule::{AutoScheduler, FillStrategy, NewShow, ScheduleStore};
use std::sync::Arc;

fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

#[test]
fn test_database_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("tv_schedules.db");

    let sched = {
        let store = ScheduleStore::open(&path).unwrap();
        let ch = store.add_channel("Weekend Classics", None).unwrap();
        let sched = store.create_schedule("Saturday", ch, at(1, 8, 0), at(1, 12, 0)).unwrap();
        let show = store.add_show(&NewShow::new("Western", 60)).unwrap();
        store.add_time_slot(sched, show, at(1, 8, 0), at(1, 9, 0)).unwrap();
        sched
    };

    let store = ScheduleStore::open(&path).unwrap();
    let slots = store.slots_for_schedule(sched).unwrap();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].show_title, "Western");
    assert_eq!(slots[0].start, at(1, 8, 0));
    assert_eq!(slots[0].duration_minutes(), 60);
}

#[test]
fn test_parallel_inserts_of_same_slot_admit_exactly_one() {
    let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
    let ch = store.add_channel("Busy", None).unwrap();
    let sched = store.create_schedule("Day", ch, at(2, 0, 0), at(2, 23, 0)).unwrap();
    let show = store.add_show(&NewShow::new("Talk", 30)).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                // Every thread targets an overlapping window around 10:00
                let start = at(2, 10, i % 3);
                store.add_time_slot(sched, show, start, start + chrono::Duration::minutes(30))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(MatrixError::Conflict { .. })))
        .count();
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);
}

#[test]
fn test_playlist_to_filled_schedule() {
    let playlist = parse_m3u(
        "#EXTM3U\n#EXTINF:-1,Cartoon Hour\nhttp://a/1\n#EXTINF:-1,Old Movie\nhttp://a/2\n#EXTINF:-1,Newsreel\nhttp://a/3\n",
    );
    let store = ScheduleStore::open_in_memory().unwrap();
    assert_eq!(store.import_shows(&playlist.channels, 45).unwrap(), 3);

    let ch = store.add_channel("Retro", None).unwrap();
    let sched = store.create_schedule("Evening", ch, at(3, 18, 0), at(3, 22, 0)).unwrap();
    let report = AutoScheduler::with_seed(FillStrategy::SmartRandom, 99)
        .fill_schedule(&store, sched, None)
        .unwrap();

    // 240 minutes of 45-minute shows
    assert_eq!(report.planned, 5);
    assert_eq!(report.created, 5);

    let slots = store.slots_for_schedule(sched).unwrap();
    assert!(slots.windows(2).all(|w| w[0].end == w[1].start));
    assert!(slots.windows(2).all(|w| w[0].show_id != w[1].show_id));
    assert!(slots.last().unwrap().end <= at(3, 22, 0));

    // A second fill over the same window clashes everywhere
    let again = AutoScheduler::new(FillStrategy::RoundRobin)
        .fill_schedule(&store, sched, None)
        .unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.skipped_conflicts, again.planned);
}

#[test]
fn test_resolve_then_add_respects_invariant() {
    let store = ScheduleStore::open_in_memory().unwrap();
    let ch = store.add_channel("Imports", None).unwrap();
    let sched = store.create_schedule("Legacy", ch, at(4, 0, 0), at(4, 23, 0)).unwrap();
    let show = store.add_show(&NewShow::new("Film", 120)).unwrap();

    store.add_time_slot_unchecked(sched, show, at(4, 20, 0), at(4, 22, 0)).unwrap();
    store.add_time_slot_unchecked(sched, show, at(4, 21, 0), at(4, 23, 0)).unwrap();
    assert_eq!(
        store.find_conflicts(sched, at(4, 21, 30), at(4, 21, 45), None).unwrap().len(),
        2
    );

    let outcome = store.resolve_conflicts(sched).unwrap();
    assert_eq!(outcome.truncated, 1);
    let slots = store.slots_for_schedule(sched).unwrap();
    assert_eq!(slots[0].end, at(4, 21, 0));
    assert!(store.resolve_conflicts(sched).unwrap().truncated == 0);
}
