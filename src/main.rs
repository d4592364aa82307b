use anyhow::Result;
use clap::{App, Arg};

use std::io::stdout;
use std::process;

mod sink;
mod symbol;
mod trace;

use sink::{EventSink, JsonSink, PlainSink};
use trace::Tracer;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("var")
                .help("The global symbol to watch")
                .long("var")
                .value_name("symbol")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("exec")
                .help("The binary to run under the watcher")
                .long("exec")
                .value_name("path")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("output-format")
                .help("The output format to use")
                .short("F")
                .long("format")
                .takes_value(true)
                .possible_values(&["plain", "json"])
                .default_value("plain"),
        )
        .arg(
            Arg::with_name("tracee-args")
                .help("The command-line arguments to execute the tracee with")
                .raw(true),
        )
}

fn run() -> Result<i32> {
    let matches = app().get_matches();

    let binary_path = matches.value_of("exec").unwrap().to_string();
    let symbol = symbol::resolve(&binary_path, matches.value_of("var").unwrap())?;

    let tracer = Tracer {
        binary_path,
        symbol,
        tracee_args: matches
            .values_of("tracee-args")
            .map(|v| v.map(|a| a.to_string()).collect())
            .unwrap_or_else(Vec::new),
    };

    let mut sink: Box<dyn EventSink> = match matches.value_of("output-format").unwrap() {
        "plain" => Box::new(PlainSink::new(stdout())),
        "json" => Box::new(JsonSink::new(stdout())),
        _ => unreachable!(),
    };

    tracer.watch(sink.as_mut())
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
