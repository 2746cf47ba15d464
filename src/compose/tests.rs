//! Unit tests for compose rendering.

use std::collections::BTreeMap;

use rstest::{fixture, rstest};
use serde_yaml::Value;

use super::*;
use crate::project::CustomService;

fn service(image: &str) -> ServiceSpec {
    ServiceSpec {
        enabled: true,
        image: image.to_owned(),
        ..ServiceSpec::default()
    }
}

fn parse(rendered: &str) -> Value {
    serde_yaml::from_str(rendered).unwrap_or_else(|err| panic!("compose should parse: {err}"))
}

fn lookup<'a>(document: &'a Value, path: &[&str]) -> &'a Value {
    path.iter().fold(document, |node, segment| {
        node.get(*segment)
            .unwrap_or_else(|| panic!("missing `{segment}` in {path:?}"))
    })
}

fn keys(node: &Value) -> Vec<&str> {
    node.as_mapping()
        .unwrap_or_else(|| panic!("expected a mapping, got {node:?}"))
        .keys()
        .filter_map(Value::as_str)
        .collect()
}

#[fixture]
fn postgres_only() -> ServicesSection {
    ServicesSection {
        postgres: Some(ServiceSpec {
            port: Some(5432),
            volumes: vec![String::from("pgdata:/var/lib/postgresql/data")],
            env: BTreeMap::from([
                (String::from("POSTGRES_USER"), String::from("app")),
                (String::from("POSTGRES_DB"), String::from("api")),
            ]),
            ..service("postgres:16")
        }),
        ..ServicesSection::default()
    }
}

#[rstest]
fn renders_postgres_block_and_volume(postgres_only: ServicesSection) {
    let rendered = render_compose(&postgres_only).expect("compose");
    let document = parse(&rendered);
    let postgres = lookup(&document, &["services", "postgres"]);

    assert_eq!(lookup(postgres, &["image"]), "postgres:16");
    assert_eq!(lookup(postgres, &["restart"]), "always");
    assert_eq!(
        lookup(postgres, &["ports"]),
        &Value::Sequence(vec![Value::from("5432:5432")])
    );
    assert_eq!(
        lookup(postgres, &["volumes"]),
        &Value::Sequence(vec![Value::from("pgdata:/var/lib/postgresql/data")])
    );
    assert_eq!(keys(lookup(postgres, &["environment"])), ["POSTGRES_DB", "POSTGRES_USER"]);
    assert_eq!(lookup(postgres, &["environment", "POSTGRES_DB"]), "api");
    assert!(postgres.get("command").is_none());
    assert_eq!(keys(lookup(&document, &["volumes"])), ["pgdata"]);
}

#[test]
fn nothing_enabled_renders_nothing() {
    let services = ServicesSection {
        redis: Some(ServiceSpec {
            enabled: false,
            ..service("redis:7")
        }),
        ..ServicesSection::default()
    };

    assert!(matches!(
        render_compose(&services),
        Err(ComposeError::NothingEnabled)
    ));
}

#[test]
fn custom_services_keep_their_own_keys() {
    let services = ServicesSection {
        custom: vec![
            CustomService {
                name: String::from("worker"),
                spec: service("busybox"),
            },
            CustomService {
                name: String::from("mailer"),
                spec: ServiceSpec {
                    command: Some(String::from("mailhog -smtp-bind-addr 0.0.0.0:25")),
                    ..service("mailhog/mailhog")
                },
            },
        ],
        ..ServicesSection::default()
    };

    let document = parse(&render_compose(&services).expect("compose"));

    assert_eq!(keys(lookup(&document, &["services"])), ["worker", "mailer"]);
    assert_eq!(lookup(&document, &["services", "worker", "image"]), "busybox");
    assert_eq!(
        lookup(&document, &["services", "mailer", "command"]),
        "mailhog -smtp-bind-addr 0.0.0.0:25"
    );
    assert!(document.get("volumes").is_none());
}

#[rstest]
#[case("true")]
#[case("no")]
#[case("5432")]
#[case("1.5")]
#[case("null")]
#[case("~")]
#[case("it's")]
#[case("say \"hi\"")]
#[case("key: value")]
#[case("two\nlines")]
#[case("")]
fn scalars_survive_as_strings(#[case] raw: &str) {
    let services = ServicesSection {
        custom: vec![CustomService {
            name: String::from("edge"),
            spec: ServiceSpec {
                command: Some(raw.to_owned()),
                env: BTreeMap::from([(String::from("FLAG"), raw.to_owned())]),
                ..service("traefik:v3")
            },
        }],
        ..ServicesSection::default()
    };

    let document = parse(&render_compose(&services).expect("compose"));

    assert_eq!(
        lookup(&document, &["services", "edge", "command"]),
        &Value::from(raw)
    );
    assert_eq!(
        lookup(&document, &["services", "edge", "environment", "FLAG"]),
        &Value::from(raw)
    );
}

#[test]
fn stateful_services_declare_fixed_volumes_in_order() {
    let services = ServicesSection {
        redis: Some(service("redis:7")),
        centrifugo: Some(service("centrifugo/centrifugo:v5")),
        typesense: Some(service("typesense/typesense:27.1")),
        custom: vec![CustomService {
            name: String::from("minio"),
            spec: ServiceSpec {
                volumes: vec![
                    String::from("minio-data:/data"),
                    String::from("./config:/etc/minio"),
                    String::from("redis-data:/backup"),
                ],
                ..service("minio/minio")
            },
        }],
        ..ServicesSection::default()
    };

    let document = parse(&render_compose(&services).expect("compose"));

    assert_eq!(
        keys(lookup(&document, &["services"])),
        ["typesense", "redis", "centrifugo", "minio"]
    );
    assert_eq!(
        keys(lookup(&document, &["volumes"])),
        ["typesense-data", "redis-data", "minio-data"]
    );
}

#[rstest]
fn rendering_is_deterministic(postgres_only: ServicesSection) {
    assert_eq!(
        render_compose(&postgres_only).expect("first render"),
        render_compose(&postgres_only.clone()).expect("second render")
    );
}

#[test]
fn compose_file_lives_under_services_directory() {
    let path = compose_path(Utf8Path::new("/opt/apps/api"));

    assert_eq!(path, Utf8PathBuf::from("/opt/apps/api/services/docker-compose.yml"));
    assert_eq!(
        up_command(&path),
        "sudo docker compose -f /opt/apps/api/services/docker-compose.yml up -d"
    );
}
