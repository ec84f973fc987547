//! Registered functions run as children of this test binary.
//!
//! Runs without the libtest harness: `init_main` has to be the first thing
//! `main` does, so re-executed copies of this binary run the requested
//! function instead of the scenarios below.

use shepherd::{
    Error, ParamType, RegistryBuilder, Shell, ShellOpts, Signal, Signature, Value, init_main,
};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

fn registry() -> shepherd::Result<RegistryBuilder> {
    RegistryBuilder::new()
        .register(
            "add",
            Signature::new().param(ParamType::Int).param(ParamType::Int),
            |args| {
                println!("{}", args.int(0)? + args.int(1)?);
                Ok(Value::Nil)
            },
        )?
        .register("join", Signature::new().param(ParamType::Str).variadic(ParamType::Str), |args| {
            let sep = args.str(0)?;
            let parts: Vec<String> = args.rest(1).iter().map(|v| v.to_string()).collect();
            println!("{}", parts.join(sep));
            Ok(Value::Nil)
        })?
        .register("fail", Signature::new(), |_| anyhow::bail!("deliberate failure"))?
        .register("serve", Signature::new(), |_| {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            shepherd::send_vars([("Addr", listener.local_addr()?.to_string())])?;
            shepherd::send_ready()?;
            for stream in listener.incoming() {
                let mut stream = stream?;
                let mut line = String::new();
                BufReader::new(&stream).read_line(&mut line)?;
                write!(stream, "echo {}", line)?;
            }
            Ok(Value::Nil)
        })
}

fn quiet() -> Shell {
    Shell::new(ShellOpts {
        suppress_output: Some(true),
        ..ShellOpts::default()
    })
    .expect("shell")
}

fn add_prints_the_sum() {
    let sh = quiet();
    let (out, _) = sh
        .fn_cmd("add", vec![2.into(), 3.into()])
        .unwrap()
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&out), "5\n");
    sh.cleanup().unwrap();
}

fn variadic_and_nil_arguments() {
    let sh = quiet();
    let (out, _) = sh
        .fn_cmd("join", vec!["-".into(), "a".into(), "b".into(), "c".into()])
        .unwrap()
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&out), "a-b-c\n");

    // Nil takes the zero value of the declared type.
    let (out, _) = sh
        .fn_cmd("add", vec![Value::Nil, 4.into()])
        .unwrap()
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&out), "4\n");
    sh.cleanup().unwrap();
}

fn bad_arguments_fail_in_the_parent() {
    let sh = quiet();
    match sh.fn_cmd("add", vec![2.into()]) {
        Err(Error::ArgCount { got, .. }) => assert_eq!(got, 1),
        other => panic!("expected ArgCount, got {:?}", other),
    }
    sh.clear_err();
    match sh.fn_cmd("add", vec![2.into(), "three".into()]) {
        Err(Error::ArgType { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected ArgType, got {:?}", other),
    }
    sh.clear_err();
    assert!(matches!(
        sh.fn_cmd("nope", Vec::new()),
        Err(Error::UnknownFunction(_))
    ));
    sh.clear_err();
    sh.cleanup().unwrap();
}

fn failing_function_exits_with_one() {
    let sh = quiet();
    match sh.fn_cmd("fail", Vec::new()).unwrap().run() {
        Err(Error::Exit { status, .. }) => assert_eq!(status.code(), Some(1)),
        other => panic!("expected Exit, got {:?}", other),
    }

    let c = sh.fn_cmd("fail", Vec::new()).unwrap().exit_error_is_ok(true);
    let (_, err) = c.output().unwrap();
    assert!(String::from_utf8_lossy(&err).contains("deliberate failure"));
    sh.cleanup().unwrap();
}

fn server_reports_address_and_shuts_down() {
    let sh = quiet();
    let server = sh.fn_cmd("serve", Vec::new()).unwrap();
    server.start().unwrap();
    server.await_ready_timeout(Duration::from_secs(10)).unwrap();
    let vars = server
        .await_vars_timeout(&["Addr"], Duration::from_secs(10))
        .unwrap();

    let mut conn = TcpStream::connect(&vars["Addr"]).unwrap();
    conn.write_all(b"ping\n").unwrap();
    let mut reply = String::new();
    BufReader::new(&conn).read_line(&mut reply).unwrap();
    assert_eq!(reply, "echo ping\n");

    server.terminate(Signal::Interrupt).unwrap();
    assert!(!server.is_running());
    sh.cleanup().unwrap();
}

fn function_child_dies_on_sigterm() {
    use std::os::unix::process::ExitStatusExt;

    let sh = quiet();
    let server = sh.fn_cmd("serve", Vec::new()).unwrap();
    server.start().unwrap();
    server.await_ready_timeout(Duration::from_secs(10)).unwrap();
    server.signal(Signal::Terminate).unwrap();
    match server.wait() {
        Err(Error::Exit { status, .. }) => assert_eq!(status.signal(), Some(libc::SIGTERM)),
        other => panic!("expected a terminated child, got {:?}", other),
    }
    sh.cleanup().unwrap();
}

fn invocation_is_not_inherited() {
    let sh = quiet();
    let (out, _) = sh
        .cmd("/bin/sh", ["-c", "echo \"[${SHEPHERD_INVOCATION:-unset}]\""])
        .unwrap()
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&out), "[unset]\n");
    sh.cleanup().unwrap();
}

fn main() -> shepherd::Result<()> {
    init_main(registry()?)?;

    let scenarios: &[(&str, fn())] = &[
        ("add_prints_the_sum", add_prints_the_sum),
        ("variadic_and_nil_arguments", variadic_and_nil_arguments),
        ("bad_arguments_fail_in_the_parent", bad_arguments_fail_in_the_parent),
        ("failing_function_exits_with_one", failing_function_exits_with_one),
        ("server_reports_address_and_shuts_down", server_reports_address_and_shuts_down),
        ("function_child_dies_on_sigterm", function_child_dies_on_sigterm),
        ("invocation_is_not_inherited", invocation_is_not_inherited),
    ];
    for (name, scenario) in scenarios {
        print!("test {} ... ", name);
        std::io::stdout().flush()?;
        scenario();
        println!("ok");
    }
    println!("\ntest result: ok. {} passed", scenarios.len());
    Ok(())
}
