//! Several threads sharing one volume

mod integration;

use integration::{formatted, read_file, write_file, TestEnvironment};
use pagefs::common::test_utils::generate_test_data;
use pretty_assertions::assert_eq;

const THREADS: usize = 4;

#[test]
fn test_threads_write_separate_files() {
    let mut env = TestEnvironment::new().unwrap();
    env.devices.attach_eeprom(0x70, 64, 128);
    let manager = env.manager().unwrap();
    let volume = formatted(&manager, 0x70).unwrap();
    volume.create("/LOGS", true, false).unwrap();

    crossbeam::scope(|s| {
        for i in 0..THREADS {
            let volume = &volume;
            s.spawn(move |_| {
                let data = generate_test_data(300 + i * 17);
                write_file(volume, &format!("/LOGS/T.{i}"), &data).unwrap();
            });
        }
    })
    .unwrap();

    let listed = volume.list("/LOGS").unwrap();
    assert_eq!(listed.len(), THREADS);
    for i in 0..THREADS {
        assert_eq!(
            read_file(&volume, &format!("/LOGS/T.{i}")).unwrap(),
            generate_test_data(300 + i * 17)
        );
    }
}

#[test]
fn test_interleaved_chunked_writers() {
    let mut env = TestEnvironment::new().unwrap();
    env.devices.attach_eeprom(0x71, 32, 200);
    let manager = env.manager().unwrap();
    let volume = formatted(&manager, 0x71).unwrap();

    crossbeam::scope(|s| {
        for i in 0..THREADS {
            let volume = volume.clone();
            s.spawn(move |_| {
                let mut writer = volume.create(&format!("/W{i}"), false, false).unwrap();
                for chunk in 0..10u8 {
                    writer.write(&[chunk.wrapping_add(i as u8); 13]).unwrap();
                }
                writer.close().unwrap();
            });
        }
    })
    .unwrap();

    for i in 0..THREADS {
        let expected: Vec<u8> = (0..10u8)
            .flat_map(|chunk| [chunk.wrapping_add(i as u8); 13])
            .collect();
        assert_eq!(read_file(&volume, &format!("/W{i}")).unwrap(), expected);
    }
}

#[test]
fn test_concurrent_mounts_share_one_volume() {
    let mut env = TestEnvironment::new().unwrap();
    env.devices.attach_eeprom(0x72, 32, 16);
    let manager = env.manager().unwrap();
    let first = formatted(&manager, 0x72).unwrap();

    let volumes = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| s.spawn(|_| manager.mount(0x72).unwrap()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    for volume in &volumes {
        assert!(volume.same_volume(&first));
    }
    assert_eq!(first.owner_count(), THREADS + 1);
    assert_eq!(manager.live_volumes(), 1);
}
