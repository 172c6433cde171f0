// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use chrono::Local;

    use replicad_lib::{state::*, test_env::TestEnvironment};

    #[test]
    fn serde1() {
        let record = Record {
            timestamp: Local::now().naive_local(),
            event: Event::Set,
            key: "resources/r0/Satellite/Drbd/NodeIdsToReset".to_string(),
            value: Some("1,4".to_string()),
        };
        let output = record.as_string();

        let new_record = Record::from_string(&output).unwrap();

        assert_eq!(record, new_record);
    }

    #[test]
    fn properties_survive_a_restart() {
        let env = TestEnvironment::new("state_restart".to_string());
        let path = env.statefile_path();
        {
            let state = State::new(&path).unwrap();
            state.set("resources/r0/a", "1").unwrap();
            state.set("resources/r0/b", "2").unwrap();
            state.set("resources/r0/a", "3").unwrap();
            state.remove("resources/r0/b").unwrap();
            state.set("resources/r1/a", "4").unwrap();
        }

        let state = State::new(&path).unwrap();
        assert_eq!(state.get("resources/r0/a").as_deref(), Some("3"));
        assert!(state.get("resources/r0/b").is_none());
        assert_eq!(
            state.with_prefix("resources/r0/"),
            vec![("resources/r0/a".to_string(), "3".to_string())]
        );
    }

    #[test]
    fn garbage_in_statefile_is_reported() {
        let env = TestEnvironment::new("state_garbage".to_string());
        let path = env.statefile_path();
        std::fs::write(&path, "not a record\n").unwrap();
        assert!(matches!(State::new(&path), Err(StateError::Parse { .. })));
    }
}
