use kvlock::{DistributedLock, LockOptions, MemoryConnection, MemoryServer, ReleaseOutcome};
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Lock(usize),
    Unlock(usize),
}

fn op(handles: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..handles).prop_map(Op::Lock),
        (0..handles).prop_map(Op::Unlock),
    ]
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_key_is_prefix_plus_resource(prefix in "[a-z:/]{0,8}", resource in "[a-zA-Z0-9_.-]{1,24}") {
        let server = MemoryServer::new();
        let options = LockOptions::default().with_key_prefix(prefix.clone());
        let lock = DistributedLock::new(server.connect(), &resource, options).unwrap();
        prop_assert_eq!(lock.key(), format!("{prefix}{resource}"));
    }

    #[test]
    fn prop_ownership_matches_single_owner_model(ops in prop::collection::vec(op(3), 1..40)) {
        let rt = paused_runtime();
        rt.block_on(async {
            let server = MemoryServer::new();
            let options = LockOptions::default()
                .with_acquire_timeout(Duration::from_millis(5))
                .with_lease_duration(Duration::from_secs(3600));
            let handles: Vec<DistributedLock<MemoryConnection>> = (0..3)
                .map(|_| DistributedLock::new(server.connect(), "model", options.clone()).unwrap())
                .collect();

            let mut owner: Option<usize> = None;
            for op in ops {
                match op {
                    Op::Lock(i) => {
                        let acquired = handles[i].acquire().await.unwrap();
                        // not reentrant: even the current owner cannot take it again
                        prop_assert_eq!(acquired, owner.is_none());
                        if acquired {
                            owner = Some(i);
                        }
                    }
                    Op::Unlock(i) => {
                        let outcome = handles[i].unlock().await.unwrap();
                        if owner == Some(i) {
                            prop_assert_eq!(outcome, ReleaseOutcome::Released);
                            owner = None;
                        } else {
                            prop_assert_eq!(outcome, ReleaseOutcome::NotOwner);
                        }
                    }
                }

                for (i, handle) in handles.iter().enumerate() {
                    prop_assert_eq!(handle.is_locked().await.unwrap(), owner == Some(i));
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
