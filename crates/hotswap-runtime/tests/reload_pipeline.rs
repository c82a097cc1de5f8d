//! End-to-end behaviour of the reload pipeline against the in-memory
//! container.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;

use hotswap_foundation::{InMemoryContainer, PropertySource, StructuralDocument};
use hotswap_kernel::config::{CoordinatorConfig, HotSwapConfig, ReparsePolicy};
use hotswap_kernel::{
    ContainerAdapter, ContainerId, LoaderId, ManagedObjectDefinition, ReloadEvent, ResourceRef,
    TypeName,
};
use hotswap_runtime::{FailureStage, HotSwapAgent, Interest, ReloadCoordinator};

fn app_loader() -> LoaderId {
    LoaderId::new("app")
}

fn coordinator_for(container: &Arc<InMemoryContainer>, config: CoordinatorConfig) -> ReloadCoordinator {
    let (events, _) = broadcast::channel(256);
    ReloadCoordinator::new(container.clone(), config, events)
}

fn drain_events(rx: &mut broadcast::Receiver<ReloadEvent>) -> Vec<ReloadEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn run_starts(events: &[ReloadEvent]) -> Vec<ContainerId> {
    events
        .iter()
        .filter_map(|event| match event {
            ReloadEvent::RunStarted { container, .. } => Some(*container),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn changed_type_recreates_object_and_its_dependents() {
    let container = Arc::new(InMemoryContainer::new(app_loader()));
    container.define(ManagedObjectDefinition::scanned("userService", "com.example.UserService"));
    container.define(
        ManagedObjectDefinition::scanned("orderService", "com.example.OrderService")
            .with_dependency("userService"),
    );
    container.preinstantiate_singletons().unwrap();
    let user_before = container.instance("userService").unwrap().generation;
    let order_before = container.instance("orderService").unwrap().generation;

    let coordinator = coordinator_for(&container, CoordinatorConfig::default());
    coordinator.add_changed_type(TypeName::new("com.example.UserService"));
    let report = coordinator.reload(1_000).await.unwrap().unwrap();

    assert!(report.was_destroyed("userService"));
    assert!(report.was_destroyed("orderService"));
    assert!(container.is_live("userService"));
    assert!(container.is_live("orderService"));
    assert!(container.instance("userService").unwrap().generation > user_before);
    assert!(container.instance("orderService").unwrap().generation > order_before);
    assert_eq!(coordinator.reload_count(), 1);
    assert_eq!(coordinator.assistant().last_reload_timestamp(), 1_000);
    assert!(!coordinator.has_pending_changes());
    assert!(coordinator.ledger().drain_all().is_empty());
    assert!(report.is_clean());
}

#[tokio::test]
async fn dependency_chain_converges_despite_reentrant_change() {
    let container = Arc::new(InMemoryContainer::new(app_loader()));
    container.define(ManagedObjectDefinition::scanned("c", "com.example.C"));
    container.define(ManagedObjectDefinition::scanned("b", "com.example.B").with_dependency("c"));
    container.define(ManagedObjectDefinition::scanned("a", "com.example.A").with_dependency("b"));
    container.preinstantiate_singletons().unwrap();

    let coordinator = coordinator_for(&container, CoordinatorConfig::default());

    // The container reports C again the first time it is destroyed.
    let ledger = coordinator.ledger().clone();
    let fired = Arc::new(AtomicBool::new(false));
    container.on_destroy(move |name| {
        if name == "c" && !fired.swap(true, Ordering::SeqCst) {
            ledger.add_changed_type(TypeName::new("com.example.C"));
        }
    });

    coordinator.add_changed_type(TypeName::new("com.example.C"));
    let report = coordinator.reload(1).await.unwrap().unwrap();

    assert_eq!(report.destroyed, vec!["c", "b", "a"]);
    assert_eq!(report.passes, 2);
    assert_eq!(container.destroyed(), vec!["c", "b", "a"]);
    assert!(["a", "b", "c"].iter().all(|name| container.is_live(name)));
    assert!(!coordinator.has_pending_changes());
}

#[tokio::test]
async fn one_failing_object_does_not_block_the_others() {
    let container = Arc::new(InMemoryContainer::new(app_loader()));
    for (name, type_name) in [
        ("x", "com.example.X"),
        ("y", "com.example.Y"),
        ("z", "com.example.Z"),
    ] {
        container.define(ManagedObjectDefinition::scanned(name, type_name));
    }
    container.preinstantiate_singletons().unwrap();
    container.fail_destroy_of("x");
    let y_before = container.instance("y").unwrap().generation;

    let coordinator = coordinator_for(&container, CoordinatorConfig::default());
    for type_name in ["com.example.X", "com.example.Y", "com.example.Z"] {
        coordinator.add_changed_type(TypeName::new(type_name));
    }
    let report = coordinator.reload(1).await.unwrap().unwrap();

    let failure = report.failure_of("x").unwrap();
    assert_eq!(failure.stage, FailureStage::Destroy);
    assert!(report.was_destroyed("y"));
    assert!(report.was_destroyed("z"));
    assert_eq!(report.recreated, vec!["y", "z"]);
    assert!(container.instance("y").unwrap().generation > y_before);
    assert!(container.is_live("x"));
    assert_eq!(coordinator.reload_count(), 1);
}

#[tokio::test]
async fn recreation_failure_is_reported_and_run_completes() {
    let container = Arc::new(InMemoryContainer::new(app_loader()));
    container.define(ManagedObjectDefinition::scanned("mailer", "com.example.Mailer"));
    container.define(ManagedObjectDefinition::scanned("repo", "com.example.Repo"));
    container.preinstantiate_singletons().unwrap();

    let coordinator = coordinator_for(&container, CoordinatorConfig::default());
    container.fail_creation_of("mailer");
    coordinator.add_changed_type(TypeName::new("com.example.Mailer"));
    coordinator.add_changed_type(TypeName::new("com.example.Repo"));
    let report = coordinator.reload(1).await.unwrap().unwrap();

    assert_eq!(report.failure_of("mailer").unwrap().stage, FailureStage::Recreate);
    assert!(!container.is_live("mailer"));
    assert!(container.is_live("repo"));
    assert_eq!(coordinator.phase(), hotswap_kernel::ReloadPhase::Idle);
    assert!(!coordinator.assistant().is_reload_in_progress());
}

#[tokio::test]
async fn unparseable_structural_resource_is_retried_on_next_reload() {
    let container = Arc::new(InMemoryContainer::new(app_loader()));
    let beans = ResourceRef::new("file:///srv/app.beans.toml");
    let declared = vec![ManagedObjectDefinition::structural(
        "mailer",
        "com.example.Mailer",
        beans.clone(),
    )];
    container.define(declared[0].clone());
    container.preinstantiate_singletons().unwrap();

    let coordinator = coordinator_for(&container, CoordinatorConfig::default());
    coordinator.track_structural(&declared);

    container.stage_structural(beans.clone(), Err("unexpected token".to_string()));
    coordinator.add_changed_structural(beans.clone());
    let report = coordinator.reload(1).await.unwrap().unwrap();
    assert_eq!(report.deferred, vec![beans.clone()]);
    assert!(container.is_live("mailer"));
    assert!(coordinator.has_pending_changes());

    container.stage_structural(
        beans.clone(),
        Ok(vec![ManagedObjectDefinition::structural(
            "mailer",
            "com.example.SmtpMailer",
            beans.clone(),
        )]),
    );
    let report = coordinator.reload(2).await.unwrap().unwrap();
    assert!(report.deferred.is_empty());
    assert!(report.was_destroyed("mailer"));
    assert_eq!(
        container.instance("mailer").unwrap().type_name,
        TypeName::new("com.example.SmtpMailer")
    );
    assert!(!coordinator.has_pending_changes());
    assert_eq!(coordinator.reload_count(), 2);
}

#[tokio::test]
async fn structural_resource_applied_by_a_later_pass_is_not_reported_deferred() {
    let container = Arc::new(InMemoryContainer::new(app_loader()));
    let beans = ResourceRef::new("file:///srv/app.beans.toml");
    container.define(ManagedObjectDefinition::structural(
        "mailer",
        "com.example.Mailer",
        beans.clone(),
    ));
    container.define(ManagedObjectDefinition::scanned("repo", "com.example.Repo"));
    container.preinstantiate_singletons().unwrap();
    let coordinator = coordinator_for(&container, CoordinatorConfig::default());

    // Destroying repo fixes the document and touches it again.
    let weak = Arc::downgrade(&container);
    let ledger = coordinator.ledger().clone();
    let fixed = beans.clone();
    container.on_destroy(move |name| {
        if name != "repo" {
            return;
        }
        if let Some(container) = weak.upgrade() {
            container.stage_structural(
                fixed.clone(),
                Ok(vec![ManagedObjectDefinition::structural(
                    "mailer",
                    "com.example.SmtpMailer",
                    fixed.clone(),
                )]),
            );
        }
        ledger.add_changed_structural(fixed.clone());
    });

    container.stage_structural(beans.clone(), Err("unexpected token".to_string()));
    coordinator.add_changed_type(TypeName::new("com.example.Repo"));
    coordinator.add_changed_structural(beans.clone());
    let report = coordinator.reload(1).await.unwrap().unwrap();

    assert_eq!(report.passes, 2);
    assert!(report.deferred.is_empty());
    assert!(report.is_clean());
    assert!(!coordinator.has_pending_changes());
    assert_eq!(
        container.instance("mailer").unwrap().type_name,
        TypeName::new("com.example.SmtpMailer")
    );
}

#[tokio::test]
async fn reparse_policy_decides_which_structural_resources_follow_a_config_change() {
    for (policy, expected_mailer) in [
        (ReparsePolicy::Affected, "com.example.Mailer"),
        (ReparsePolicy::All, "com.example.SmtpMailer"),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let beans_path = dir.path().join("app.beans.toml");
        let props_path = dir.path().join("app.properties");
        std::fs::write(
            &beans_path,
            "[[definitions]]\nname = \"mailer\"\ntype = \"com.example.Mailer\"\n",
        )
        .unwrap();
        std::fs::write(&props_path, "mail.host=a\n").unwrap();
        let beans = ResourceRef::from_path(&beans_path);
        let props = ResourceRef::from_path(&props_path);

        let container = Arc::new(InMemoryContainer::new(app_loader()));
        let declared = StructuralDocument::load(&beans).unwrap();
        for def in &declared {
            container.define(def.clone());
        }
        container.bind_config(props.clone(), PropertySource::load(&props).unwrap());
        container.define(
            ManagedObjectDefinition::scanned("repo", "com.example.Repo").with_placeholder("mail.host"),
        );
        container.preinstantiate_singletons().unwrap();

        let coordinator = coordinator_for(
            &container,
            CoordinatorConfig::default().with_reparse_policy(policy),
        );
        coordinator.track_structural(&declared);

        std::fs::write(
            &beans_path,
            "[[definitions]]\nname = \"mailer\"\ntype = \"com.example.SmtpMailer\"\n",
        )
        .unwrap();
        std::fs::write(&props_path, "mail.host=b\n").unwrap();
        coordinator.add_changed_config(props.clone());
        let report = coordinator.reload(1).await.unwrap().unwrap();

        assert!(report.was_destroyed("repo"), "{policy:?}");
        assert_eq!(
            container.instance("repo").unwrap().resolved["mail.host"],
            "b",
            "{policy:?}"
        );
        assert_eq!(
            container.instance("mailer").unwrap().type_name,
            TypeName::new(expected_mailer),
            "{policy:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn parent_container_reloads_before_child() {
    let agent = HotSwapAgent::install(HotSwapConfig::default()).unwrap();
    agent.register_interest(Interest::new(r"^com\.example\.").unwrap());
    let mut events = agent.subscribe();

    let parent = Arc::new(InMemoryContainer::new(app_loader()));
    let child = Arc::new(InMemoryContainer::child_of(&parent));
    for container in [&parent, &child] {
        container.define(ManagedObjectDefinition::scanned("shared", "com.example.Shared"));
        container.preinstantiate_singletons().unwrap();
    }
    // Child first, so registration order cannot explain the result.
    agent.register_container(child.clone());
    agent.register_container(parent.clone());

    let out = agent.on_class_file_transform(&app_loader(), "com/example/Shared", true, b"\xCA\xFE");
    assert!(out.is_none());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let events = drain_events(&mut events);
    assert_eq!(run_starts(&events), vec![parent.id(), child.id()]);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pending_child_reload_waits_for_parent_triggered_later() {
    let agent = HotSwapAgent::install(HotSwapConfig::default()).unwrap();
    agent.register_interest(Interest::new(r"^com\.example\.").unwrap());
    let mut events = agent.subscribe();

    let parent = Arc::new(InMemoryContainer::new(app_loader()));
    let child = Arc::new(InMemoryContainer::child_of(&parent));
    for container in [&parent, &child] {
        container.define(ManagedObjectDefinition::scanned("shared", "com.example.Shared"));
        container.preinstantiate_singletons().unwrap();
    }
    agent.register_container(parent.clone());
    agent.register_container(child.clone());

    agent.request_reload(child.id()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    agent.on_class_file_transform(&app_loader(), "com/example/Shared", true, b"\xCA\xFE");

    tokio::time::sleep(Duration::from_secs(1)).await;
    let events = drain_events(&mut events);
    assert_eq!(run_starts(&events), vec![parent.id(), child.id()]);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rearmed_parent_reload_still_runs_before_child() {
    let agent = HotSwapAgent::install(HotSwapConfig::default()).unwrap();
    agent.register_interest(Interest::new(r"^com\.example\.").unwrap());
    let mut events = agent.subscribe();

    let parent = Arc::new(InMemoryContainer::new(app_loader()));
    let child = Arc::new(InMemoryContainer::child_of(&parent));
    for container in [&parent, &child] {
        container.define(ManagedObjectDefinition::scanned("shared", "com.example.Shared"));
        container.preinstantiate_singletons().unwrap();
    }
    let parent_coordinator = agent.register_container(parent.clone());
    let child_coordinator = agent.register_container(child.clone());

    agent.on_class_file_transform(&app_loader(), "com/example/Shared", true, b"\xCA\xFE");
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Pushes the parent's window past the child's.
    agent.request_reload(parent.id()).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let events = drain_events(&mut events);
    assert_eq!(run_starts(&events), vec![parent.id(), child.id()]);
    assert_eq!(parent_coordinator.reload_count(), 1);
    assert_eq!(child_coordinator.reload_count(), 1);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_redefinitions_yields_one_reload() {
    let agent = HotSwapAgent::install(HotSwapConfig::default()).unwrap();
    agent.register_interest(Interest::new(r"^com\.example\.").unwrap());

    let container = Arc::new(InMemoryContainer::new(app_loader()));
    container.define(ManagedObjectDefinition::scanned("userService", "com.example.UserService"));
    container.preinstantiate_singletons().unwrap();
    let coordinator = agent.register_container(container.clone());

    for _ in 0..3 {
        agent.on_class_file_transform(&app_loader(), "com.example.UserService", true, b"\xCA\xFE");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(coordinator.reload_count(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(coordinator.reload_count(), 1);
    assert_eq!(container.destroyed(), vec!["userService"]);
    agent.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn newly_defined_candidate_is_registered_and_created() {
    let agent = HotSwapAgent::install(HotSwapConfig::default()).unwrap();
    agent.register_interest(Interest::new(r"^com\.example\.").unwrap());

    let container = Arc::new(InMemoryContainer::new(app_loader()));
    container.add_scan_candidate(ManagedObjectDefinition::scanned(
        "auditService",
        "com.example.AuditService",
    ));
    let coordinator = agent.register_container(container.clone());

    agent.on_class_file_transform(&app_loader(), "com/example/AuditService", false, b"\xCA\xFE");
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(container.get_definition("auditService").await.is_ok());
    assert!(container.is_live("auditService"));
    assert_eq!(coordinator.reload_count(), 1);
    agent.shutdown().await;
}

#[tokio::test]
async fn watched_properties_file_reaches_placeholder_users() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let props_path = root.join("app.properties");
    std::fs::write(&props_path, "mail.host=a\n").unwrap();
    let props = ResourceRef::from_path(&props_path);

    let mut config = HotSwapConfig::default();
    config.scheduler.reload_delay_millis = 50;
    config.watch = config.watch.with_root(&root, app_loader());
    let agent = HotSwapAgent::install(config).unwrap();

    let container = Arc::new(InMemoryContainer::new(app_loader()));
    container.bind_config(props.clone(), PropertySource::load(&props).unwrap());
    container.define(
        ManagedObjectDefinition::scanned("mailer", "com.example.Mailer").with_placeholder("mail.host"),
    );
    container.preinstantiate_singletons().unwrap();
    let coordinator = agent.register_container(container.clone());

    std::fs::write(&props_path, "mail.host=b\n").unwrap();

    let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
        while coordinator.reload_count() == 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(reloaded.is_ok(), "no reload within 10s");
    assert_eq!(container.instance("mailer").unwrap().resolved["mail.host"], "b");
    agent.shutdown().await;
}

#[tokio::test]
async fn watched_structural_file_reaches_declared_objects() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let beans_path = root.join("app.beans.toml");
    std::fs::write(
        &beans_path,
        "[[definitions]]\nname = \"mailer\"\ntype = \"com.example.Mailer\"\n",
    )
    .unwrap();
    let beans = ResourceRef::from_path(&beans_path);

    let mut config = HotSwapConfig::default();
    config.scheduler.reload_delay_millis = 50;
    config.watch = config.watch.with_root(&root, app_loader());
    let agent = HotSwapAgent::install(config).unwrap();

    let container = Arc::new(InMemoryContainer::new(app_loader()));
    for def in StructuralDocument::load(&beans).unwrap() {
        container.define(def);
    }
    container.preinstantiate_singletons().unwrap();
    let coordinator = agent.register_container(container.clone());

    std::fs::write(
        &beans_path,
        "[[definitions]]\nname = \"mailer\"\ntype = \"com.example.SmtpMailer\"\n",
    )
    .unwrap();

    let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
        while coordinator.reload_count() == 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(reloaded.is_ok(), "no reload within 10s");
    assert_eq!(
        container.instance("mailer").unwrap().type_name,
        TypeName::new("com.example.SmtpMailer")
    );
    assert_eq!(coordinator.assistant().names_from(&beans).len(), 1);
    agent.shutdown().await;
}
