use m3u_matrix_lib::channel::{Channel, ChannelStatus};
use m3u_matrix_lib::organize;
use m3u_matrix_lib::parser::{read_playlist_file, write_playlist_file};
use std::sync::Arc;

const SAMPLE: &str = "#EXTM3U url-tvg=\"http://guide.example/epg.xml.gz\"\n\
#EXTINF:-1 tvg-id=\"one.uk\" tvg-chno=\"7\" group-title=\"UK\",Channel%20One\n\
#EXTGRP:Entertainment\n\
#EXTVLCOPT:http-user-agent=Mozilla\n\
#EXTBAK:http://mirror.example/one.m3u8\n\
http://live.example/one.m3u8\n\
#EXTINF:-1,Sports Two\n\
http://live.example/two.m3u8\n";

#[test]
fn test_file_round_trip_keeps_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in.m3u");
    std::fs::write(&src, SAMPLE).unwrap();

    let playlist = read_playlist_file(&src).unwrap();
    assert_eq!(playlist.epg_url.as_deref(), Some("http://guide.example/epg.xml.gz"));
    assert_eq!(playlist.channels.len(), 2);
    let one = &playlist.channels[0];
    assert_eq!(one.name, "Channel One");
    assert_eq!(one.group, "Entertainment");
    assert_eq!(one.num, 7);
    assert_eq!(one.backups, vec!["http://mirror.example/one.m3u8".to_string()]);
    assert_eq!(playlist.channels[1].num, 2);

    let out = dir.path().join("out.m3u");
    write_playlist_file(&out, &playlist.channels, playlist.epg_url.as_deref()).unwrap();
    let again = read_playlist_file(&out).unwrap();
    assert_eq!(again.channels.len(), 2);
    assert_eq!(again.channels[0].group, "Entertainment");
    assert_eq!(again.channels[0].backups, one.backups);
    assert_eq!(again.channels[0].custom_tags, one.custom_tags);
    assert_eq!(again.epg_url, playlist.epg_url);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_json_export_keeps_status() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channels.json");
    let mut ch = Channel::new("Movies", "http://a/1");
    ch.status = ChannelStatus::Broken;
    write_playlist_file(&path, &[ch.clone()], None).unwrap();

    let loaded = read_playlist_file(&path).unwrap();
    assert_eq!(loaded.channels, vec![ch]);
}

#[test]
fn test_latin1_file_is_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("latin1.m3u");
    let mut bytes = b"#EXTM3U\n#EXTINF:-1 group-title=\"Fran".to_vec();
    bytes.push(0xE7); // c-cedilla in Latin-1
    bytes.extend_from_slice(b"ais\",T\xE9l\xE9\nhttp://a/tele\n");
    std::fs::write(&path, bytes).unwrap();

    let playlist = read_playlist_file(&path).unwrap();
    assert_eq!(playlist.channels[0].name, "Télé");
    assert_eq!(playlist.channels[0].group, "Français");
}

#[test]
fn test_concurrent_writers_never_leave_partial_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = Arc::new(dir.path().join("shared.m3u"));

    let handles: Vec<_> = (0..8)
        .map(|writer| {
            let path = Arc::clone(&path);
            std::thread::spawn(move || {
                let channels: Vec<Channel> = (0..200)
                    .map(|i| Channel::new(format!("w{}-{}", writer, i), format!("http://w{}/{}", writer, i)))
                    .collect();
                for _ in 0..5 {
                    write_playlist_file(&path, &channels, None).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let playlist = read_playlist_file(&path).unwrap();
    assert_eq!(playlist.channels.len(), 200);
    let prefix = playlist.channels[0].name.split('-').next().unwrap().to_string();
    assert!(playlist.channels.iter().all(|c| c.name.starts_with(&format!("{}-", prefix))));
}

#[test]
fn test_merge_files_in_argument_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.m3u");
    let b = dir.path().join("b.txt");
    std::fs::write(&a, "#EXTM3U\n#EXTINF:-1,Alpha\nhttp://a/1\n").unwrap();
    std::fs::write(&b, "Beta, http://b/1\nGamma | http://b/2\nhttp://b/delta.ts\n").unwrap();

    let merged = organize::merge_files(&[a, b]).unwrap();
    let names: Vec<_> = merged.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Alpha", "Beta", "Gamma", "delta"]);

    let missing = dir.path().join("missing.m3u");
    assert!(organize::merge_files(&[missing]).is_err());
}
