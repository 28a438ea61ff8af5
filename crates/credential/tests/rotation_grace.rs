//! Grace window behaviour of rotated keys under a manual clock

use keyward_credential::config::{ENCRYPTION_KEY_SECRET, JWT_SECRET, ServiceConfig};
use keyward_credential::prelude::*;
use keyward_credential::secrets::MapSecretSource;
use keyward_credential::{KeyState, ManualClock};
use rstest::rstest;
use std::sync::Arc;
use std::time::Duration;

const GRACE: Duration = Duration::from_millis(2000);

struct Harness {
    manager: LifecycleManager,
    clock: Arc<ManualClock>,
    old_key: SecretString,
    new_key: SecretString,
}

async fn rotated_open_route_service() -> Harness {
    let ors = ServiceId::new("openRouteService").unwrap();
    let mut config = LifecycleConfig::default();
    config.services = vec![ServiceConfig {
        grace_period: GRACE,
        ..ServiceConfig::new(ServiceId::new("openRouteService").unwrap(), "OPENROUTE_API_KEY")
    }];

    let old_key = SecretString::new("ors-key-before");
    let new_key = SecretString::new("ors-key-after");
    let source = StaticCredentialSource::new().with_key(ors.clone(), "ors-key-before");
    source.push_replacement(ors, new_key.clone());

    let clock = Arc::new(ManualClock::default());
    let manager = LifecycleManager::builder()
        .config(config)
        .secret_source(Arc::new(
            MapSecretSource::new()
                .with(ENCRYPTION_KEY_SECRET, "Grace-Test-Master-Key-0123456789-abcd")
                .with(JWT_SECRET, "Grace-Test-Jwt-Secret-0123456789-abcde"),
        ))
        .credential_source(Arc::new(source))
        .clock(clock.clone())
        .spawn_background_tasks(false)
        .initialize()
        .await
        .unwrap();

    manager.rotate_keys("openRouteService").await.unwrap();
    Harness {
        manager,
        clock,
        old_key,
        new_key,
    }
}

#[tokio::test]
async fn test_previous_key_valid_at_1000ms_invalid_at_2500ms() {
    let h = rotated_open_route_service().await;

    h.clock.advance(Duration::from_millis(1000));
    assert!(h.manager.is_valid_key("openRouteService", &h.old_key).await.unwrap());

    h.clock.advance(Duration::from_millis(1500));
    assert!(!h.manager.is_valid_key("openRouteService", &h.old_key).await.unwrap());
    assert!(h.manager.is_valid_key("openRouteService", &h.new_key).await.unwrap());
}

#[rstest]
#[case::just_before(GRACE - Duration::from_millis(1), true)]
#[case::at_boundary(GRACE, false)]
#[case::just_after(GRACE + Duration::from_millis(1), false)]
#[tokio::test]
async fn test_grace_boundary(#[case] elapsed: Duration, #[case] valid: bool) {
    let h = rotated_open_route_service().await;
    h.clock.advance(elapsed);
    assert_eq!(
        h.manager.is_valid_key("openRouteService", &h.old_key).await.unwrap(),
        valid
    );
}

#[tokio::test]
async fn test_key_states_across_the_window() {
    let h = rotated_open_route_service().await;
    let ors = ServiceId::new("openRouteService").unwrap();
    let rotation = h.manager.rotation();

    assert_eq!(rotation.key_state(&ors, &h.new_key), KeyState::Active);
    assert!(matches!(
        rotation.key_state(&ors, &h.old_key),
        KeyState::Retiring { .. }
    ));
    assert_eq!(
        rotation.key_state(&ors, &SecretString::new("never-issued")),
        KeyState::Revoked
    );

    h.clock.advance(GRACE);
    assert_eq!(rotation.key_state(&ors, &h.old_key), KeyState::Revoked);
    assert_eq!(rotation.key_state(&ors, &h.new_key), KeyState::Active);
}

#[tokio::test]
async fn test_tick_purges_retiring_key_after_grace() {
    let h = rotated_open_route_service().await;
    let ors = ServiceId::new("openRouteService").unwrap();

    h.clock.advance(GRACE);
    let tick = h.manager.rotation().run_due_rotations().await;
    assert_eq!(tick.purged, vec![ors.clone()]);
    assert!(h.manager.rotation().current(&ors).unwrap().retiring().is_none());
}
