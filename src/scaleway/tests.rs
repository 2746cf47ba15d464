//! Unit tests for Scaleway payload handling.

use std::collections::HashMap;
use std::net::IpAddr;

use rstest::rstest;
use scaleway_rs::ScalewayImage;

use super::image::{filter_images, select_latest};
use super::types::{ServerList, SshKeyList, TaskEnvelope};
use super::*;

fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: String::new(),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn spec() -> InstanceSpec {
    InstanceSpec::builder()
        .name("web-1")
        .zone("fr-par-1")
        .instance_type("DEV1-S")
        .image("ubuntu_jammy")
        .architecture("x86_64")
        .build()
        .expect("valid spec")
}

#[test]
fn latest_available_image_for_architecture_wins() {
    let images = vec![
        image("old", "x86_64", "available", "2024-01-01T00:00:00Z"),
        image("new", "x86_64", "available", "2024-06-01T00:00:00Z"),
        image("arm", "arm64", "available", "2024-09-01T00:00:00Z"),
        image("broken", "x86_64", "error", "2024-12-01T00:00:00Z"),
    ];

    let chosen = select_latest(filter_images(images, "x86_64"), &spec()).expect("image");

    assert_eq!(chosen, "new");
}

#[test]
fn missing_image_is_not_found() {
    let err = select_latest(Vec::new(), &spec()).expect_err("no candidates");
    assert!(matches!(err, CloudError::NotFound { kind: "image", .. }));
}

#[test]
fn server_list_keeps_only_exact_name() {
    let list: ServerList = serde_json::from_str(
        r#"{"servers":[
            {"id":"1","name":"web-10","state":"running"},
            {"id":"2","name":"web-1","state":"running","public_ip":{"address":"51.15.0.7"}}
        ]}"#,
    )
    .expect("server list");

    let server = exact_match(list.servers, "web-1").expect("exact match");
    let instance = server.into_instance("fr-par-1");

    assert_eq!(instance.id, "2");
    assert_eq!(instance.public_ip, "51.15.0.7".parse::<IpAddr>().ok());
}

#[test]
fn routed_ip_list_supplies_address_when_legacy_field_is_null() {
    let list: ServerList = serde_json::from_str(
        r#"{"servers":[{"id":"9","name":"api","state":"starting","public_ip":null,
            "public_ips":[{"address":"2001:db8::5"}]}]}"#,
    )
    .expect("server list");

    let instance = exact_match(list.servers, "api")
        .expect("server")
        .into_instance("nl-ams-1");

    assert_eq!(instance.public_ip, "2001:db8::5".parse::<IpAddr>().ok());
    assert_eq!(instance.zone, "nl-ams-1");
}

#[rstest]
#[case("pending", OperationStatus::Running)]
#[case("started", OperationStatus::Running)]
#[case("success", OperationStatus::Succeeded)]
#[case("failure", OperationStatus::Failed { message: String::from("server_poweron failed") })]
fn task_status_maps_to_operation_status(#[case] raw: &str, #[case] expected: OperationStatus) {
    let body = format!(
        r#"{{"task":{{"id":"t-1","status":"{raw}","description":"server_poweron"}}}}"#
    );
    let envelope: TaskEnvelope = serde_json::from_str(&body).expect("task");
    assert_eq!(envelope.task.status(), expected);
}

#[test]
fn ssh_key_list_converts_entries() {
    let list: SshKeyList = serde_json::from_str(
        r#"{"ssh_keys":[{"id":"k-1","name":"laptop","fingerprint":"256 SHA256:abc","public_key":"ssh-ed25519 AAAAC3Nza laptop"}],"total_count":1}"#,
    )
    .expect("ssh keys");

    let keys: Vec<SshKey> = list.ssh_keys.into_iter().map(SshKey::from).collect();

    assert_eq!(
        keys,
        vec![SshKey {
            id: String::from("k-1"),
            name: String::from("laptop"),
            fingerprint: String::from("256 SHA256:abc"),
            public_key: String::from("ssh-ed25519 AAAAC3Nza laptop"),
        }]
    );
}

fn registered_keys() -> Vec<SshKey> {
    vec![
        SshKey {
            id: String::from("k-1"),
            name: String::from("laptop"),
            fingerprint: String::new(),
            public_key: String::from("ssh-ed25519 AAAAC3Nza me@laptop\n"),
        },
        SshKey {
            id: String::from("k-2"),
            name: String::from("ci"),
            fingerprint: String::new(),
            public_key: String::from("ssh-rsa AAAAB3Nza ci"),
        },
    ]
}

#[test]
fn selected_key_becomes_an_authorized_key_tag() {
    let tags = authorized_key_tags(&registered_keys(), &[String::from("k-2")]).expect("tags");

    assert_eq!(tags, vec![String::from("AUTHORIZED_KEY=ssh-rsa_AAAAB3Nza_ci")]);
}

#[test]
fn authorized_key_tags_trim_the_key_line() {
    let tags = authorized_key_tags(&registered_keys(), &[String::from("k-1")]).expect("tags");

    assert_eq!(tags, vec![String::from("AUTHORIZED_KEY=ssh-ed25519_AAAAC3Nza_me@laptop")]);
}

#[test]
fn unknown_selected_key_is_not_found() {
    let err = authorized_key_tags(&registered_keys(), &[String::from("k-9")])
        .expect_err("missing key");

    assert_eq!(
        err,
        CloudError::NotFound {
            kind: "SSH key",
            name: String::from("k-9"),
        }
    );
}

#[test]
fn api_error_carries_status_and_message() {
    let err = api_error(
        "create server",
        StatusCode::BAD_REQUEST,
        br#"{"type":"invalid_arguments","message":"commercial_type is invalid"}"#,
    );
    let CloudError::Provider { action, message } = err else {
        panic!("expected provider error");
    };
    assert_eq!(action, "create server");
    assert!(message.starts_with("400 Bad Request: "), "{message}");
    assert!(message.contains("commercial_type is invalid"), "{message}");
}
