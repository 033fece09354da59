use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::env;
use std::io::{self, Read};
use tokio::runtime::{Builder, Runtime};

use crate::config::PluginConf;
use crate::logging;
use crate::plugin::ChainedPlugin;
use crate::types::{CmdArgs, CniError, SUPPORTED_VERSIONS};

/// Parse command arguments from environment
pub fn parse_args() -> Result<CmdArgs> {
    let container_id = env::var("CNI_CONTAINERID").context("CNI_CONTAINERID not found in environment")?;
    let netns = env::var("CNI_NETNS").context("CNI_NETNS not found in environment")?;
    let ifname = env::var("CNI_IFNAME").context("CNI_IFNAME not found in environment")?;
    let path = env::var("CNI_PATH").unwrap_or_default();

    let args = parse_cni_args(&env::var("CNI_ARGS").unwrap_or_default());

    let mut stdin_data = Vec::new();
    io::stdin()
        .read_to_end(&mut stdin_data)
        .context("Failed to read from stdin")?;

    Ok(CmdArgs {
        container_id,
        netns,
        ifname,
        args,
        path,
        stdin_data,
    })
}

/// Parse CNI_ARGS (`K=V;K=V`) into key-value pairs
pub fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Namespace switches are per thread; keep every future on this one
fn runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")
}

/// Parse the configuration, start logging and build the plugin
fn prepare<P: ChainedPlugin>() -> Result<P> {
    let args = parse_args()?;
    let conf = PluginConf::parse(&args.stdin_data)?;
    logging::init(&conf.log_options, P::LOG_FILE);
    tracing::debug!(plugin = P::NAME, stdin = %String::from_utf8_lossy(&args.stdin_data), "parsed configuration");
    Ok(P::new(conf, args))
}

/// Execute the add command
pub fn cmd_add<P: ChainedPlugin>() -> Result<()> {
    let plugin: P = prepare()?;
    let result = runtime()?.block_on(plugin.add_network())?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

/// Execute the delete command
pub fn cmd_del<P: ChainedPlugin>() -> Result<()> {
    let plugin: P = prepare()?;
    runtime()?.block_on(plugin.del_network())
}

/// Execute the check command
pub fn cmd_check<P: ChainedPlugin>() -> Result<()> {
    let plugin: P = prepare()?;
    runtime()?.block_on(plugin.check_network())
}

/// Supported versions document printed for `VERSION`
pub fn version_info() -> serde_json::Value {
    serde_json::json!({
        "cniVersion": "1.0.0",
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

/// Main entry point for a chained plugin
pub fn run_cni<P: ChainedPlugin>() -> Result<()> {
    let cmd = env::var("CNI_COMMAND").context("CNI_COMMAND not found in environment")?;

    match cmd.as_str() {
        "ADD" => cmd_add::<P>(),
        "DEL" => cmd_del::<P>(),
        "CHECK" => cmd_check::<P>(),
        "VERSION" => {
            println!("{}", version_info());
            Ok(())
        }
        _ => bail!("Unknown CNI command: {}", cmd),
    }
}

/// Run `P` as a CNI binary: on failure the error chain goes to stderr as a
/// CNI error object and the process exits with status 1.
pub fn main<P: ChainedPlugin>() {
    if let Err(err) = run_cni::<P>() {
        tracing::error!(plugin = P::NAME, error = %format!("{err:#}"), "CNI plugin error");
        let error = CniError::new("1.0.0", format!("{err:#}"));
        match serde_json::to_string(&error) {
            Ok(json) => eprintln!("{json}"),
            Err(_) => eprintln!("{err:#}"),
        }
        std::process::exit(1);
    }
}
