//! Tests for launch configuration types and the isolator registry.

mod common;

use common::{Events, TestIsolator};
use corral::{
    CommandSpec, Config, ContainerDescriptor, ContainerKind, Error, Image, Isolator,
    IsolatorRegistry,
};

// =============================================================================
// Command Merge
// =============================================================================

#[test]
fn test_merge_overwrites_scalars_and_appends_repeated_fields() {
    let mut base = CommandSpec {
        value: Some("./run".to_string()),
        arguments: vec!["--verbose".to_string()],
        shell: Some(false),
        ..CommandSpec::default()
    };

    let overlay = CommandSpec {
        value: Some("./other".to_string()),
        arguments: vec!["--color".to_string()],
        ..CommandSpec::default()
    };

    base.merge_from(&overlay);

    assert_eq!(base.value.as_deref(), Some("./other"));
    assert_eq!(base.shell, Some(false));
    assert_eq!(base.arguments, vec!["--verbose", "--color"]);
}

#[test]
fn test_merge_overlays_environment() {
    let mut base = CommandSpec::shell("run");
    base.environment.insert("A".to_string(), "1".to_string());
    base.environment.insert("B".to_string(), "1".to_string());

    let mut overlay = CommandSpec::default();
    overlay.environment.insert("B".to_string(), "2".to_string());

    base.merge_from(&overlay);
    assert_eq!(base.environment.get("A").map(String::as_str), Some("1"));
    assert_eq!(base.environment.get("B").map(String::as_str), Some("2"));
    // Unset scalars leave the base untouched.
    assert_eq!(base.value.as_deref(), Some("run"));
}

// =============================================================================
// Container Descriptors
// =============================================================================

#[test]
fn test_descriptor_constructors() {
    let plain = ContainerDescriptor::mesos();
    assert_eq!(plain.kind, ContainerKind::Mesos);
    assert!(plain.image.is_none());

    let imaged = ContainerDescriptor::with_image(Image::Docker {
        name: "alpine:3.18".to_string(),
    });
    assert!(imaged.image.is_some());
}

// =============================================================================
// Isolator Registry
// =============================================================================

fn registry_with(names: &[&str]) -> IsolatorRegistry {
    let events = Events::default();
    let mut registry = IsolatorRegistry::new();
    for name in names {
        let prototype = TestIsolator::new(name, events.clone());
        registry.register(*name, move |_config| {
            Ok(Box::new(prototype.clone()) as Box<dyn Isolator>)
        });
    }
    registry
}

fn config_with_isolation(isolation: &str) -> Config {
    Config {
        isolation: isolation.to_string(),
        ..Config::default()
    }
}

#[test]
fn test_resolve_preserves_declared_order() {
    let registry = registry_with(&["posix/cpu", "posix/mem", "network/ports"]);
    let isolators = registry
        .resolve(&config_with_isolation("posix/mem,network/ports,posix/cpu"))
        .unwrap();

    let names: Vec<&str> = isolators.iter().map(|i| i.name()).collect();
    assert_eq!(names, vec!["posix/mem", "network/ports", "posix/cpu"]);
}

#[test]
fn test_resolve_puts_filesystem_isolators_first() {
    let registry = registry_with(&["posix/cpu", "filesystem/posix"]);
    let isolators = registry
        .resolve(&config_with_isolation("posix/cpu,filesystem/posix"))
        .unwrap();

    let names: Vec<&str> = isolators.iter().map(|i| i.name()).collect();
    assert_eq!(names, vec!["filesystem/posix", "posix/cpu"]);
}

#[test]
fn test_resolve_rejects_unknown_isolator() {
    let registry = registry_with(&["posix/cpu"]);
    let err = registry
        .resolve(&config_with_isolation("posix/cpu,gpu/nvidia"))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownIsolator(name) if name == "gpu/nvidia"));
}

#[test]
fn test_resolve_rejects_duplicate_isolator() {
    let registry = registry_with(&["posix/cpu"]);
    let err = registry
        .resolve(&config_with_isolation("posix/cpu,posix/cpu"))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateIsolator(name) if name == "posix/cpu"));
}

#[test]
fn test_resolve_tolerates_whitespace_and_empty_entries() {
    let registry = registry_with(&["posix/cpu", "posix/mem"]);
    let isolators = registry
        .resolve(&config_with_isolation(" posix/cpu, ,posix/mem ,"))
        .unwrap();
    assert_eq!(isolators.len(), 2);
}

// =============================================================================
// Builder Validation
// =============================================================================

#[test]
fn test_builder_requires_every_collaborator() {
    let err = corral::Containerizer::builder(config_with_isolation(""))
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Misconfigured(_)));
}

#[test]
fn test_builder_rejects_both_disk_isolators() {
    let err = corral::Containerizer::builder(config_with_isolation("posix/disk,disk/du"))
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Misconfigured(reason) if reason.contains("disk")));
}
