//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeRemote`] stands in for an SSH session: it records every command,
//! answers from scripted rules, and keeps an in-memory file system that
//! understands the handful of commands the pipelines use to move files
//! around. [`ScriptedCloud`] does the same for the provider API.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::build::{BuildError, BuildFuture, BuildOutput, Builder};
use crate::cloud::{
    CloudApi, CloudError, CloudFuture, Instance, InstanceCreation, InstanceSpec, OperationStatus,
    PendingOperation, SshKey,
};
use crate::project::ArtifactKind;
use crate::transport::{RemoteShell, TransportError, TransportFuture, TreePlan};
use crate::wait::OperationSource;

/// File stored by [`FakeRemote`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFile {
    /// Raw bytes.
    pub contents: Vec<u8>,
    /// Whether any execute bit is set.
    pub executable: bool,
}

impl RemoteFile {
    /// Contents decoded as UTF-8, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents).into_owned()
    }
}

#[derive(Clone, Debug)]
enum Reply {
    Output(String),
    Fail { exit_status: i32, output: String },
    Hold,
}

#[derive(Debug, Default)]
struct RemoteState {
    commands: Vec<String>,
    interactive: Vec<String>,
    shells: usize,
    rules: Vec<(String, Reply)>,
    files: BTreeMap<Utf8PathBuf, RemoteFile>,
    upload_budget: Option<u64>,
    upload_root: Option<Utf8PathBuf>,
    hold_uploads: bool,
    hold_interactive: bool,
}

/// In-memory [`RemoteShell`] double.
///
/// Rules match on substrings of the raw command text; the most recently
/// added matching rule wins. Commands without a failing rule are also
/// interpreted against the in-memory file system (`mv`, `cp -R`,
/// `chmod +x`, `rm -f`, `rm -rf`, and `printf '%s' … | tee`).
#[derive(Clone, Debug, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    /// Creates an empty remote.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers commands containing `pattern` with `output`.
    pub fn respond(&self, pattern: &str, output: &str) {
        self.lock()
            .rules
            .push((pattern.to_owned(), Reply::Output(output.to_owned())));
    }

    /// Fails commands containing `pattern` with the given exit status and
    /// output.
    pub fn fail(&self, pattern: &str, exit_status: i32, output: &str) {
        self.lock().rules.push((
            pattern.to_owned(),
            Reply::Fail {
                exit_status,
                output: output.to_owned(),
            },
        ));
    }

    /// Leaves commands containing `pattern` pending forever once recorded.
    pub fn hold(&self, pattern: &str) {
        self.lock().rules.push((pattern.to_owned(), Reply::Hold));
    }

    /// Places a file on the fake host.
    pub fn seed_file(&self, path: &str, contents: &[u8], executable: bool) {
        self.lock().files.insert(
            Utf8PathBuf::from(path),
            RemoteFile {
                contents: contents.to_vec(),
                executable,
            },
        );
    }

    /// Returns the file at `path`, if any.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<RemoteFile> {
        self.lock().files.get(Utf8Path::new(path)).cloned()
    }

    /// Returns every stored path.
    #[must_use]
    pub fn paths(&self) -> Vec<Utf8PathBuf> {
        self.lock().files.keys().cloned().collect()
    }

    /// Makes every later upload fail after writing `bytes` bytes of the
    /// payload to its destination.
    pub fn fail_uploads_after(&self, bytes: u64) {
        self.lock().upload_budget = Some(bytes);
    }

    /// Rejects uploads outside `root`, as a host would for a login user
    /// without write access.
    pub fn restrict_uploads_to(&self, root: &str) {
        self.lock().upload_root = Some(Utf8PathBuf::from(root));
    }

    /// Makes every later upload stall without completing.
    pub fn hold_uploads(&self) {
        self.lock().hold_uploads = true;
    }

    /// Makes interactive commands run until cancelled.
    pub fn hold_interactive(&self) {
        self.lock().hold_interactive = true;
    }

    /// Commands passed to `run_command`, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Commands passed to `run_interactive`, in order.
    #[must_use]
    pub fn interactive_commands(&self) -> Vec<String> {
        self.lock().interactive.clone()
    }

    /// Number of shells opened.
    #[must_use]
    pub fn shells_opened(&self) -> usize {
        self.lock().shells
    }

    /// Index of the first recorded command containing `pattern`.
    #[must_use]
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.lock()
            .commands
            .iter()
            .position(|command| command.contains(pattern))
    }

    fn reply_for(state: &RemoteState, command: &str) -> Option<Reply> {
        state
            .rules
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
    }

    fn execute(&self, command: &str) -> Result<String, TransportError> {
        let mut state = self.lock();
        state.commands.push(command.to_owned());
        let output = match Self::reply_for(&state, command) {
            Some(Reply::Fail {
                exit_status,
                output,
            }) => {
                return Err(TransportError::CommandFailed {
                    command: command.to_owned(),
                    exit_status,
                    output,
                });
            }
            Some(Reply::Output(output)) => output,
            Some(Reply::Hold) | None => String::new(),
        };
        interpret(&mut state.files, command).map_err(|message| TransportError::CommandFailed {
            command: command.to_owned(),
            exit_status: 1,
            output: message,
        })?;
        Ok(output)
    }

    async fn stall_if_held(&self) {
        let held = self.lock().hold_uploads;
        if held {
            std::future::pending::<()>().await;
        }
    }

    fn store_upload(&self, local: &Utf8Path, remote: &Utf8Path) -> Result<(), TransportError> {
        let transfer = |message: String| TransportError::Transfer {
            local: local.to_path_buf(),
            remote: remote.to_path_buf(),
            message,
        };
        let contents = std::fs::read(local).map_err(|err| transfer(err.to_string()))?;
        let executable = std::fs::metadata(local)
            .map(|meta| meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false);

        let mut state = self.lock();
        if let Some(root) = &state.upload_root
            && !remote.starts_with(root)
        {
            return Err(transfer(String::from("scp: Permission denied")));
        }
        if let Some(budget) = state.upload_budget {
            let written = usize::try_from(budget).unwrap_or(usize::MAX).min(contents.len());
            if written < contents.len() {
                let partial = contents.get(..written).unwrap_or_default().to_vec();
                state.files.insert(
                    remote.to_path_buf(),
                    RemoteFile {
                        contents: partial,
                        executable,
                    },
                );
                return Err(transfer(String::from("connection reset during transfer")));
            }
        }
        state.files.insert(
            remote.to_path_buf(),
            RemoteFile {
                contents,
                executable,
            },
        );
        Ok(())
    }
}

impl RemoteShell for FakeRemote {
    fn run_command<'a>(&'a self, command: &'a str) -> TransportFuture<'a, String> {
        Box::pin(async move {
            let held = {
                let mut state = self.lock();
                let held = matches!(Self::reply_for(&state, command), Some(Reply::Hold));
                if held {
                    state.commands.push(command.to_owned());
                }
                held
            };
            if held {
                std::future::pending::<()>().await;
            }
            self.execute(command)
        })
    }

    fn run_interactive<'a>(
        &'a self,
        command: &'a str,
        cancel: &'a CancellationToken,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let (reply, hold) = {
                let mut state = self.lock();
                state.interactive.push(command.to_owned());
                (Self::reply_for(&state, command), state.hold_interactive)
            };
            if hold {
                cancel.cancelled().await;
            }
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled {
                    command: command.to_owned(),
                });
            }
            match reply {
                Some(Reply::Fail {
                    exit_status,
                    output,
                }) => Err(TransportError::CommandFailed {
                    command: command.to_owned(),
                    exit_status,
                    output,
                }),
                _ => Ok(()),
            }
        })
    }

    fn open_shell(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.lock().shells += 1;
            Ok(())
        })
    }

    fn upload_file<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.stall_if_held().await;
            self.store_upload(local, remote)
        })
    }

    fn upload_tree<'a>(
        &'a self,
        local: &'a Utf8Path,
        remote: &'a Utf8Path,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.stall_if_held().await;
            let plan = TreePlan::scan(local, remote)?;
            for file in &plan.files {
                self.store_upload(&local.join(file), &remote.join(file))?;
            }
            Ok(())
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Op(&'static str),
}

/// Splits a POSIX shell command into words and control operators. Handles
/// single quotes, double quotes without expansion, and backslash escapes.
fn tokenize(command: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    word.push(inner);
                }
            }
            '"' => {
                in_word = true;
                while let Some(inner) = chars.next() {
                    match inner {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        other => word.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            '&' if chars.peek() == Some(&'&') => {
                chars.next();
                flush_word(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Op("&&"));
            }
            '|' if chars.peek() == Some(&'|') => {
                chars.next();
                flush_word(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Op("||"));
            }
            '|' => {
                flush_word(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Op("|"));
            }
            ';' => {
                flush_word(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Op(";"));
            }
            '>' => {
                flush_word(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::Op(">"));
            }
            space if space.is_whitespace() => flush_word(&mut tokens, &mut word, &mut in_word),
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }
    flush_word(&mut tokens, &mut word, &mut in_word);
    tokens
}

fn flush_word(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
    if *in_word {
        tokens.push(Token::Word(std::mem::take(word)));
        *in_word = false;
    }
}

fn interpret(
    files: &mut BTreeMap<Utf8PathBuf, RemoteFile>,
    command: &str,
) -> Result<(), String> {
    let tokens = tokenize(command);
    for sequence in tokens.split(|token| matches!(token, Token::Op("&&" | ";"))) {
        // Only the left side of `a || b` runs in the fake.
        let segment = sequence
            .split(|token| *token == Token::Op("||"))
            .next()
            .unwrap_or_default();
        interpret_segment(files, segment)?;
    }
    Ok(())
}

fn words(tokens: &[Token]) -> Vec<&str> {
    tokens
        .iter()
        .filter_map(|token| match token {
            Token::Word(word) => Some(word.as_str()),
            Token::Op(_) => None,
        })
        .filter(|word| *word != "sudo")
        .collect()
}

fn interpret_segment(
    files: &mut BTreeMap<Utf8PathBuf, RemoteFile>,
    segment: &[Token],
) -> Result<(), String> {
    let mut pipeline = segment.split(|token| *token == Token::Op("|"));
    let first = words(pipeline.next().unwrap_or_default());
    let second = pipeline.next().map(words);

    match (first.as_slice(), second.as_deref()) {
        (["printf", "%s", content], Some(["tee", path, ..])) => {
            files.insert(
                Utf8PathBuf::from(*path),
                RemoteFile {
                    contents: content.as_bytes().to_vec(),
                    executable: false,
                },
            );
        }
        (["mv", source, destination], None) => {
            let file = files
                .remove(Utf8Path::new(source))
                .ok_or_else(|| format!("mv: cannot stat '{source}': No such file or directory"))?;
            files.insert(Utf8PathBuf::from(*destination), file);
        }
        (["cp", "-R", source, destination], None) => {
            let source_root = Utf8Path::new(source.strip_suffix("/.").unwrap_or(source));
            let copies: Vec<(Utf8PathBuf, RemoteFile)> = files
                .iter()
                .filter_map(|(path, file)| {
                    path.strip_prefix(source_root)
                        .ok()
                        .map(|relative| (Utf8Path::new(destination).join(relative), file.clone()))
                })
                .collect();
            if copies.is_empty() {
                return Err(format!("cp: cannot stat '{source}': No such file or directory"));
            }
            files.extend(copies);
        }
        (["chmod", "+x", path], None) => {
            let file = files
                .get_mut(Utf8Path::new(path))
                .ok_or_else(|| format!("chmod: cannot access '{path}': No such file or directory"))?;
            file.executable = true;
        }
        (["rm", "-f", paths @ ..], None) => {
            for path in paths {
                files.remove(Utf8Path::new(path));
            }
        }
        (["rm", "-rf", paths @ ..], None) => {
            files.retain(|stored, _| !paths.iter().any(|path| stored.starts_with(path)));
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug, Default)]
struct CloudState {
    instances: BTreeMap<String, Instance>,
    ssh_keys: Vec<SshKey>,
    statuses: VecDeque<OperationStatus>,
    created: Vec<InstanceSpec>,
    deleted: Vec<String>,
    public_ip: Option<IpAddr>,
    next_operation: u32,
}

/// In-memory [`CloudApi`] double.
#[derive(Clone, Debug, Default)]
pub struct ScriptedCloud {
    state: Arc<Mutex<CloudState>>,
}

impl ScriptedCloud {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an existing instance.
    pub fn add_instance(&self, instance: Instance) {
        self.lock().instances.insert(instance.name.clone(), instance);
    }

    /// Registers an SSH key.
    pub fn add_ssh_key(&self, id: &str, name: &str) {
        self.lock().ssh_keys.push(SshKey {
            id: id.to_owned(),
            name: name.to_owned(),
            fingerprint: format!("256 SHA256:{id}"),
            public_key: format!("ssh-ed25519 AAAAC3Nza{id} {name}"),
        });
    }

    /// Queues a status answer. Once the queue is empty every query reports
    /// success.
    pub fn push_status(&self, status: OperationStatus) {
        self.lock().statuses.push_back(status);
    }

    /// Address assigned to instances created from now on.
    pub fn assign_public_ip(&self, address: IpAddr) {
        self.lock().public_ip = Some(address);
    }

    /// Specs passed to `create_instance`.
    #[must_use]
    pub fn created(&self) -> Vec<InstanceSpec> {
        self.lock().created.clone()
    }

    /// Names passed to `delete_instance` that existed.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    fn operation(state: &mut CloudState, resource_id: &str, zone: &str) -> PendingOperation {
        state.next_operation += 1;
        PendingOperation {
            operation_id: format!("task-{}", state.next_operation),
            resource_id: resource_id.to_owned(),
            zone: zone.to_owned(),
        }
    }
}

impl OperationSource for ScriptedCloud {
    fn operation_status<'a>(
        &'a self,
        operation: &'a PendingOperation,
    ) -> CloudFuture<'a, OperationStatus> {
        Box::pin(async move {
            let mut state = self.lock();
            let status = state
                .statuses
                .pop_front()
                .unwrap_or(OperationStatus::Succeeded);
            if status == OperationStatus::Succeeded {
                if let Some(instance) = state
                    .instances
                    .values_mut()
                    .find(|instance| instance.id == operation.resource_id)
                {
                    instance.state = String::from("running");
                }
            }
            Ok(status)
        })
    }
}

impl CloudApi for ScriptedCloud {
    fn create_instance<'a>(&'a self, spec: &'a InstanceSpec) -> CloudFuture<'a, InstanceCreation> {
        Box::pin(async move {
            spec.validate()?;
            let mut state = self.lock();
            if state.instances.contains_key(&spec.name) {
                return Err(CloudError::AlreadyExists {
                    kind: "instance",
                    name: spec.name.clone(),
                });
            }
            state.created.push(spec.clone());
            let instance = Instance {
                id: format!("srv-{}", state.created.len()),
                name: spec.name.clone(),
                zone: spec.zone.clone(),
                state: String::from("starting"),
                instance_type: spec.instance_type.clone(),
                public_ip: state.public_ip,
            };
            state
                .instances
                .insert(instance.name.clone(), instance.clone());
            let operation = Self::operation(&mut state, &instance.id, &spec.zone);
            Ok(InstanceCreation {
                instance,
                operation,
            })
        })
    }

    fn get_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<Instance>> {
        Box::pin(async move { Ok(self.lock().instances.get(name).cloned()) })
    }

    fn delete_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, PendingOperation> {
        Box::pin(async move {
            let mut state = self.lock();
            let instance = state
                .instances
                .remove(name)
                .ok_or_else(|| CloudError::NotFound {
                    kind: "instance",
                    name: name.to_owned(),
                })?;
            state.deleted.push(name.to_owned());
            Ok(Self::operation(&mut state, &instance.id, &instance.zone))
        })
    }

    fn list_ssh_keys(&self) -> CloudFuture<'_, Vec<SshKey>> {
        Box::pin(async move { Ok(self.lock().ssh_keys.clone()) })
    }
}

/// [`Builder`] double that writes canned artifacts into scratch directories.
#[derive(Debug, Default)]
pub struct StubBuilder {
    binary: Vec<u8>,
    tree: Vec<(String, String)>,
    fail: bool,
    builds: AtomicUsize,
}

impl StubBuilder {
    /// Produces an executable with `contents` for binary artifacts.
    #[must_use]
    pub fn binary(contents: &[u8]) -> Self {
        Self {
            binary: contents.to_vec(),
            ..Self::default()
        }
    }

    /// Produces a tree of `(relative path, contents)` files for static
    /// artifacts.
    #[must_use]
    pub fn tree(files: &[(&str, &str)]) -> Self {
        Self {
            tree: files
                .iter()
                .map(|(path, contents)| ((*path).to_owned(), (*contents).to_owned()))
                .collect(),
            ..Self::default()
        }
    }

    /// Fails every build.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Number of builds requested.
    #[must_use]
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn produce(&self, artifact: &ArtifactKind) -> Result<BuildOutput, BuildError> {
        let staging = |err: std::io::Error| BuildError::Staging {
            message: err.to_string(),
        };
        let scratch = tempfile::tempdir().map_err(staging)?;
        let root = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf()).map_err(|path| {
            BuildError::Staging {
                message: format!("non UTF-8 scratch path {}", path.display()),
            }
        })?;
        match artifact {
            ArtifactKind::Binary { build, .. } => {
                let path = root.join(&build.output);
                std::fs::write(&path, &self.binary).map_err(staging)?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .map_err(staging)?;
                Ok(BuildOutput::scoped(path, scratch))
            }
            ArtifactKind::StaticTree { build } => {
                let tree = root.join(&build.output);
                for (relative, contents) in &self.tree {
                    let path = tree.join(relative);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).map_err(staging)?;
                    }
                    std::fs::write(&path, contents).map_err(staging)?;
                }
                std::fs::create_dir_all(&tree).map_err(staging)?;
                Ok(BuildOutput::scoped(tree, scratch))
            }
        }
    }
}

impl Builder for StubBuilder {
    fn build<'a>(
        &'a self,
        artifact: &'a ArtifactKind,
        cancel: &'a CancellationToken,
    ) -> BuildFuture<'a> {
        Box::pin(async move {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            if self.fail {
                return Err(BuildError::Failed {
                    command: String::from("cargo build"),
                    status: String::from("exit status: 101"),
                    code: Some(101),
                });
            }
            self.produce(artifact)
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    /// Pairs with an empty value remove the variable instead.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                if value.is_empty() {
                    env::remove_var(key);
                } else {
                    env::set_var(key, value);
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
