//! Shared project descriptors for integration tests.
//!
//! Include with:
//!
//! ```rust
//! #[path = "common/descriptors.rs"]
//! mod descriptors;
//! ```

/// Rust service with a Postgres sidecar and port preflight.
pub const SERVICE_WITH_POSTGRES: &str = r#"
name: api
server:
  name: api-server
  zone: fr-par-1
  type: DEV1-S
  image: ubuntu_jammy
  free_ports: [80, 443]
build:
  entry: api
  output: app
deploy:
  remote_path: /opt/apps/api
  service_name: api
  env:
    APP_ENV: production
services:
  postgres:
    enabled: true
    image: postgres:16
    port: 5432
    volumes: ["pgdata:/var/lib/postgresql/data"]
    env:
      POSTGRES_DB: api
"#;

/// Static site deployed into a web root.
pub const STATIC_SITE: &str = r"
name: site
server: { name: site-server, zone: fr-par-1, type: DEV1-S, image: ubuntu_jammy }
build: { command: npm run build, dir: web, output: dist }
deploy: { remote_path: /var/www/site, kind: static }
";
