use std::process::{Output, Stdio};
use std::{collections::BTreeMap, fmt, io::Error as IoError, sync::OnceLock, time::Duration};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex;

use crate::error::{FlowError, Result};

/// A program invocation with its own environment overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

/// Renders the command line only; environment values stay out of the output.
impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('\'') {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

pub fn parse_duration(text: &str) -> Result<Duration> {
    text.trim()
        .parse::<humantime::Duration>()
        .map(Into::into)
        .map_err(|e| {
            FlowError::Definition(format!(
                "invalid duration '{}': {} (use a format like '5m', '30s', '1h30m')",
                text, e
            ))
        })
}

/// Serde adapter storing durations as humantime strings ("5m").
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_duration(&text).map_err(D::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| crate::util::parse_duration(&text).map_err(D::Error::custom))
                .transpose()
        }
    }
}

pub async fn run_command(command: &ProcessCommand, stream_output: bool) -> Result<Output> {
    let mut cmd = TokioCommand::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null());

    let mut child = cmd.spawn().map_err(|source| FlowError::Command {
        program: command.program.clone(),
        source,
    })?;

    let stdout_handle = tokio::spawn(collect_pipe(
        child.stdout.take(),
        tokio::io::stdout(),
        stream_output,
    ));
    let stderr_handle = tokio::spawn(collect_pipe(
        child.stderr.take(),
        tokio::io::stderr(),
        stream_output,
    ));

    let status = child.wait().await?;

    let stdout = join_pipe(stdout_handle).await?;
    let stderr = join_pipe(stderr_handle).await?;

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

async fn collect_pipe<R, W>(pipe: Option<R>, mut sink: W, stream_output: bool) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut collected: Vec<u8> = Vec::new();
    if let Some(mut pipe) = pipe {
        let mut buf = [0u8; 8192];
        loop {
            let n = pipe.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if stream_output {
                sink.write_all(&buf[..n]).await?;
            }
        }
        if stream_output {
            sink.flush().await?;
        }
    }
    Ok(collected)
}

async fn join_pipe(handle: tokio::task::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(FlowError::Io(IoError::other(e))),
    }
}

static OUTPUT_PRINT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn output_print_lock() -> &'static Mutex<()> {
    OUTPUT_PRINT_LOCK.get_or_init(|| Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_humantime_durations() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("five minutes").is_err());
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let command = ProcessCommand::new("sh")
            .arg("-c")
            .arg("npm i && node index.js");
        assert_eq!(command.to_string(), "sh -c 'npm i && node index.js'");
    }

    #[test]
    fn display_never_includes_environment_values() {
        let mut env = BTreeMap::new();
        env.insert("DB_PASSWORD".to_string(), "hunter2".to_string());
        let command = ProcessCommand::new("sh").arg("-c").arg("true").envs(&env);
        assert!(!command.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn run_command_captures_output_and_status() {
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hola".to_string());
        let command = ProcessCommand::new("sh")
            .arg("-c")
            .arg("echo $GREETING; exit 3")
            .envs(&env);

        let output = run_command(&command, false).await.unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hola");
    }

    #[tokio::test]
    async fn missing_program_is_a_command_error() {
        let command = ProcessCommand::new("ehrflow-definitely-not-a-program");
        assert!(matches!(
            run_command(&command, false).await,
            Err(FlowError::Command { .. })
        ));
    }
}
