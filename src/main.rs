//! Binary entry point for the `berth` CLI.

mod cli;

use std::fmt::Display;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::{self, Write};
use std::path::Path;
use std::process;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use berth::cloud::{CloudError, Instance};
use berth::compose::{ComposeError, render_compose};
use berth::project::starter_descriptor;
use berth::unit::{journal_command, systemctl};
use berth::{
    ConfigError, ConfigStore, ConfigStoreError, ConfigWriter, Credentials, DeployError, Deployer,
    HostLifecycle, HostRequest, LifecycleError, LocalBuilder, ProjectDescriptor, ProjectError,
    ProvisionError, Provisioner, RemoteShell, ScalewayCloud, SshSession, TransportError,
};

use cli::{Cli, Command, ComposeCommand, LogsCommand};

/// Exit status after a second interrupt, matching a shell killed by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Environment variable holding the tracing filter.
const LOG_ENV_VAR: &str = "BERTH_LOG";

/// Best-effort host checks printed by `berth status`.
const HOST_CHECKS: [(&str, &str); 3] = [
    ("containers", "sudo docker ps"),
    ("disk", "df -h /"),
    ("memory", "free -h"),
];

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("could not save credentials: {0}")]
    ConfigStore(#[from] ConfigStoreError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error("server {name} already exists; run `berth deploy` or `berth setup` instead")]
    AlreadyProvisioned { name: String },
    #[error("server {name} not found; run `berth provision` first")]
    NotProvisioned { name: String },
    #[error("{path} already exists; remove it first to start over")]
    DescriptorExists { path: String },
    #[error("`berth {action}` needs a service deploy, but this project deploys static files")]
    StaticProject { action: &'static str },
    #[error("no sidecar services are enabled in the descriptor")]
    NoServices,
    #[error("destroy aborted")]
    Aborted,
    #[error("interrupted")]
    Interrupted,
    #[error("failed to access {path}: {message}")]
    Io { path: String, message: String },
}

impl CliError {
    fn io(path: impl Display, err: &io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let exit_code = match dispatch(args, &cancel).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// The first Ctrl-C cancels in-flight work; a second exits at once.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupted; cancelling (press Ctrl-C again to exit now)");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            process::exit(INTERRUPTED_EXIT_CODE);
        }
    });
}

/// Runs `work` unless `cancel` fires first.
async fn interruptible<T, E>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, CliError>
where
    CliError: From<E>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CliError::Interrupted),
        result = work => Ok(result?),
    }
}

async fn dispatch(args: Cli, cancel: &CancellationToken) -> Result<(), CliError> {
    let descriptor_path = args.config.as_path();
    match args.command {
        Command::Init => init_descriptor(descriptor_path),
        Command::Auth(auth) => {
            let path = ConfigStore::new()
                .write_credentials(&auth.secret_key, auth.project_id.as_deref())?;
            say(format_args!("saved credentials to {path}"));
            Ok(())
        }
        Command::Compose(compose) => write_compose(descriptor_path, &compose),
        Command::Provision(provision) => {
            let project = Project::load(descriptor_path)?;
            project.provision(provision.ssh_key.as_deref(), cancel).await
        }
        Command::Setup => {
            let project = Project::load(descriptor_path)?;
            let (_, session) = project.connect(cancel).await?;
            project.setup(&session, cancel).await
        }
        Command::Deploy => Project::load(descriptor_path)?.deploy(cancel).await,
        Command::Status => Project::load(descriptor_path)?.status(cancel).await,
        Command::Logs(logs) => Project::load(descriptor_path)?.logs(&logs, cancel).await,
        Command::Ssh => {
            let (_, session) = Project::load(descriptor_path)?.connect(cancel).await?;
            interruptible(cancel, session.open_shell()).await
        }
        Command::Start => Project::load(descriptor_path)?.control("start", cancel).await,
        Command::Stop => Project::load(descriptor_path)?.control("stop", cancel).await,
        Command::Restart => {
            Project::load(descriptor_path)?
                .control("restart", cancel)
                .await
        }
        Command::Destroy(destroy) => {
            Project::load(descriptor_path)?
                .destroy(destroy.force, cancel)
                .await
        }
    }
}

/// A loaded descriptor plus the directory builds run in.
struct Project {
    descriptor: ProjectDescriptor,
    root: Utf8PathBuf,
    credentials: Credentials,
}

impl Project {
    fn load(path: &Path) -> Result<Self, CliError> {
        let descriptor_path = utf8_path(path)?;
        let descriptor = ProjectDescriptor::load(&descriptor_path)?;
        let root = descriptor_path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .map_or_else(|| Utf8PathBuf::from("."), Utf8Path::to_path_buf);
        let credentials = Credentials::load_without_cli_args()?;
        Ok(Self {
            descriptor,
            root,
            credentials,
        })
    }

    fn cloud(&self) -> ScalewayCloud {
        ScalewayCloud::new(&self.credentials, self.descriptor.server.zone.as_str())
    }

    fn lifecycle<'a>(&self, cloud: &'a ScalewayCloud) -> HostLifecycle<'a, ScalewayCloud> {
        HostLifecycle::new(cloud)
            .with_poll_interval(self.credentials.poll_interval())
            .with_reachability_timeout(self.credentials.reachability_timeout())
            .with_ssh_port(self.credentials.ssh_port)
    }

    fn server_name(&self) -> &str {
        &self.descriptor.server.name
    }

    fn service(&self, action: &'static str) -> Result<String, CliError> {
        self.descriptor
            .deployment_plan()
            .service()
            .map(|binary| binary.service.clone())
            .ok_or(CliError::StaticProject { action })
    }

    async fn find_instance(&self, cancel: &CancellationToken) -> Result<Instance, CliError> {
        let cloud = self.cloud();
        interruptible(cancel, self.lifecycle(&cloud).find_host(self.server_name()))
            .await
            .map_err(|err| match err {
                CliError::Lifecycle(LifecycleError::Cloud(CloudError::NotFound { .. })) => {
                    CliError::NotProvisioned {
                        name: self.server_name().to_owned(),
                    }
                }
                other => other,
            })
    }

    async fn open_session(
        &self,
        instance: &Instance,
        cancel: &CancellationToken,
    ) -> Result<SshSession, CliError> {
        let address = instance.public_ip.ok_or_else(|| LifecycleError::NoAddress {
            name: instance.name.clone(),
        })?;
        let target = self.credentials.remote_target(&address.to_string());
        interruptible(cancel, SshSession::connect(target)).await
    }

    async fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Instance, SshSession), CliError> {
        let instance = self.find_instance(cancel).await?;
        let session = self.open_session(&instance, cancel).await?;
        Ok((instance, session))
    }

    async fn provision(
        &self,
        ssh_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), CliError> {
        let cloud = self.cloud();
        let request = HostRequest::from_descriptor(&self.descriptor, ssh_key);
        let instance = self
            .lifecycle(&cloud)
            .create_host(&request, cancel)
            .await
            .map_err(|err| match err {
                LifecycleError::Cloud(CloudError::AlreadyExists { name, .. }) => {
                    CliError::AlreadyProvisioned { name }
                }
                other => other.into(),
            })?;
        if let Some(address) = instance.public_ip {
            say(format_args!("server {} is reachable at {address}", instance.name));
        }
        let session = self.open_session(&instance, cancel).await?;
        self.setup(&session, cancel).await
    }

    async fn setup(&self, session: &SshSession, cancel: &CancellationToken) -> Result<(), CliError> {
        let report = Provisioner::new(session, &self.descriptor)
            .with_ssh_port(self.credentials.ssh_port)
            .setup(cancel)
            .await?;
        for port in &report.port_conflicts {
            say(format_args!("warning: port {port} is already in use on the server"));
        }
        for warning in &report.warnings {
            say(format_args!("warning: {warning}"));
        }
        say(format_args!("server {} is set up", self.server_name()));
        Ok(())
    }

    async fn deploy(&self, cancel: &CancellationToken) -> Result<(), CliError> {
        let (_, session) = self.connect(cancel).await?;
        let plan = self.descriptor.deployment_plan();
        let builder = LocalBuilder::new(self.root.clone());
        let report = Deployer::new(&session, &builder, &plan)
            .deploy(cancel)
            .await?;
        say(format_args!("deployed to {}", report.installed));
        if let Some(status) = report.status {
            say(format_args!("service status: {status}"));
        }
        Ok(())
    }

    async fn status(&self, cancel: &CancellationToken) -> Result<(), CliError> {
        let instance = self.find_instance(cancel).await?;
        say(format_args!("server:  {}", instance.name));
        say(format_args!("state:   {}", instance.state));
        say(format_args!("type:    {}", instance.instance_type));
        let Some(address) = instance.public_ip else {
            say("address: (none)");
            return Ok(());
        };
        say(format_args!("address: {address}"));

        let session = match self.open_session(&instance, cancel).await {
            Ok(session) => session,
            Err(CliError::Interrupted) => return Err(CliError::Interrupted),
            Err(err) => {
                say(format_args!("(could not connect: {err})"));
                return Ok(());
            }
        };
        let mut checks: Vec<(&str, String)> = Vec::new();
        if let Ok(service) = self.service("status") {
            checks.push(("service", format!("{} --no-pager", systemctl("status", &service))));
        }
        checks.extend(
            HOST_CHECKS
                .iter()
                .map(|(label, command)| (*label, (*command).to_owned())),
        );
        for (label, command) in checks {
            say(format_args!("\n[{label}]"));
            match interruptible(cancel, session.run_command(&command)).await {
                Ok(output) => say(output.trim_end()),
                Err(CliError::Transport(err)) => {
                    say(err.output().map_or_else(|| err.to_string(), str::to_owned));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn logs(&self, logs: &LogsCommand, cancel: &CancellationToken) -> Result<(), CliError> {
        let service = self.service("logs")?;
        let (_, session) = self.connect(cancel).await?;
        let command = journal_command(&service, logs.lines, logs.follow);
        match session.run_interactive(&command, cancel).await {
            Ok(()) | Err(TransportError::Cancelled { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn control(&self, verb: &'static str, cancel: &CancellationToken) -> Result<(), CliError> {
        let service = self.service(verb)?;
        let (_, session) = self.connect(cancel).await?;
        interruptible(cancel, session.run_command(&systemctl(verb, &service))).await?;
        say(format_args!("{verb}: {service}"));
        Ok(())
    }

    async fn destroy(&self, force: bool, cancel: &CancellationToken) -> Result<(), CliError> {
        let name = self.server_name();
        if !force && !interruptible(cancel, confirm_destroy(name)).await? {
            return Err(CliError::Aborted);
        }
        let cloud = self.cloud();
        if self.lifecycle(&cloud).destroy_host(name, cancel).await? {
            say(format_args!("server {name} destroyed"));
        } else {
            say(format_args!("server {name} does not exist; nothing to destroy"));
        }
        Ok(())
    }
}

async fn confirm_destroy(name: &str) -> Result<bool, CliError> {
    let mut stdout = io::stdout();
    write!(stdout, "This deletes server {name}. Type its name to confirm: ")
        .and_then(|()| stdout.flush())
        .map_err(|err| CliError::io("stdout", &err))?;
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .map_err(|err| CliError::io("stdin", &err))?;
    Ok(answer.trim() == name)
}

fn init_descriptor(path: &Path) -> Result<(), CliError> {
    let descriptor_path = utf8_path(path)?;
    let cwd = std::env::current_dir().map_err(|err| CliError::io(".", &err))?;
    let name = cwd
        .file_name()
        .and_then(|dir| dir.to_str())
        .unwrap_or("app")
        .to_owned();
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&descriptor_path)
        .map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                CliError::DescriptorExists {
                    path: descriptor_path.to_string(),
                }
            } else {
                CliError::io(&descriptor_path, &err)
            }
        })?;
    file.write_all(starter_descriptor(&name).as_bytes())
        .map_err(|err| CliError::io(&descriptor_path, &err))?;
    say(format_args!("wrote {descriptor_path}"));
    Ok(())
}

fn write_compose(path: &Path, compose: &ComposeCommand) -> Result<(), CliError> {
    let descriptor = ProjectDescriptor::load(&utf8_path(path)?)?;
    if !descriptor.services.any_enabled() {
        return Err(CliError::NoServices);
    }
    let rendered = render_compose(&descriptor.services)?;
    let output = utf8_path(&compose.output)?;
    std::fs::write(&output, rendered).map_err(|err| CliError::io(&output, &err))?;
    say(format_args!("wrote {output}"));
    Ok(())
}

fn utf8_path(path: &Path) -> Result<Utf8PathBuf, CliError> {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|raw| CliError::Io {
        path: raw.display().to_string(),
        message: String::from("path is not valid UTF-8"),
    })
}

fn say(line: impl Display) {
    writeln!(io::stdout(), "{line}").ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}
