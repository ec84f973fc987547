use anyhow::{Context, Result};
use colored::*;
use log::info;
use shepherd::{ParamType, RegistryBuilder, Shell, ShellOpts, Signal, Signature, Value};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

/// Functions this binary can run as its own children.
pub fn registry() -> shepherd::Result<RegistryBuilder> {
    RegistryBuilder::new()
        .register("serve", Signature::new().param(ParamType::Str), |args| {
            serve(args.str(0)?)?;
            Ok(Value::Nil)
        })?
        .register("get", Signature::new().param(ParamType::Str), |args| {
            let mut body = String::new();
            TcpStream::connect(args.str(0)?)?.read_to_string(&mut body)?;
            print!("{}", body);
            Ok(Value::Nil)
        })?
        .register("echo", Signature::new().variadic(ParamType::Str), |args| {
            let words: Vec<String> = args.rest(0).iter().map(|v| v.to_string()).collect();
            println!("{}", words.join(" "));
            Ok(Value::Nil)
        })
}

// Greets every connection until killed.
fn serve(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    shepherd::send_vars([("Addr", local.to_string())])?;
    shepherd::send_ready()?;
    for stream in listener.incoming() {
        let mut stream = stream?;
        let peer = stream.peer_addr()?;
        writeln!(stream, "hello {} from {}", peer, local)?;
    }
    Ok(())
}

pub fn handle_demo() -> Result<()> {
    let sh = Shell::new(ShellOpts::default())?;
    let result = demo(&sh);
    sh.cleanup()?;
    result
}

fn demo(sh: &Shell) -> Result<()> {
    let server = sh.fn_cmd("serve", vec!["127.0.0.1:0".into()])?;
    server.start().context("Failed to start the server function")?;
    server.await_ready()?;
    let vars = server.await_vars(&["Addr"])?;
    let addr = vars.get("Addr").cloned().unwrap_or_default();
    info!("{} Server listening on {}", "🚀".green(), addr.bold());

    let (stdout, _) = sh
        .fn_cmd("get", vec![addr.into()])?
        .suppress_output(true)
        .output()?;
    println!("{}", String::from_utf8_lossy(&stdout).trim_end());

    server.terminate(Signal::Interrupt)?;
    info!("{} Server stopped", "✅".green());
    Ok(())
}
