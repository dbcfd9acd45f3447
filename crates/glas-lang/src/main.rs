use glas_lang::{check, init_config, run_command_text, run_operation, run_script};

fn help() -> ! {
    println!("The glas command line interface is primarily executed as:");
    println!();
    println!("    glas opname Arg1 Arg2 ...");
    println!("        # shorthand for");
    println!("    glas --run cli.opname Arg1 Arg2 ...");
    println!();
    println!("Other run modes:");
    println!();
    println!("    glas --script.FileExt FileName Arg1 Arg2 ...");
    println!("        # intended for shebang use, ignoring the file's extension");
    println!("    glas --cmd.FileExt ScriptText Arg1 Arg2 ...");
    println!("        # interprets text as a file with the given extension");
    println!();
    println!("Modes that do not run an application:");
    println!();
    println!("    glas --help             # print this text");
    println!("    glas --version          # print version info");
    println!("    glas --check [Module]   # compile a module, or run builtin tests");
    println!("    glas --init             # create the configuration file");
    println!();
    println!("Configuration is file-based. The active configuration comes from");
    println!("the GLAS_CONF environment variable, falling back to:");
    println!();
    println!("    ~/.config/glas/conf.glas          # Linux");
    println!("    %AppData%\\glas\\conf.glas          # Windows");
    std::process::exit(0)
}

#[derive(Debug)]
enum Mode {
    Run(String, Vec<String>),
    Script(String, String, Vec<String>),
    Cmd(String, String, Vec<String>),
    Check(Option<String>),
    Init,
    Version,
    Help,
    Unrecognized,
}

fn parse_args(args: Vec<String>) -> Mode {
    if !args.is_empty() && !args[0].starts_with('-') {
        let opname = format!("cli.{}", args[0]);
        return Mode::Run(opname, args[1..].to_vec());
    }
    match args.first().map(|s| s.as_str()) {
        Some("--run") if args.len() >= 2 => Mode::Run(args[1].clone(), args[2..].to_vec()),
        Some(flag) if flag.starts_with("--script.") && args.len() >= 2 => Mode::Script(
            flag["--script.".len()..].to_string(),
            args[1].clone(),
            args[2..].to_vec(),
        ),
        Some(flag) if flag.starts_with("--cmd.") && args.len() >= 2 => Mode::Cmd(
            flag["--cmd.".len()..].to_string(),
            args[1].clone(),
            args[2..].to_vec(),
        ),
        Some("--check") if args.len() <= 2 => Mode::Check(args.get(1).cloned()),
        Some("--init") if args.len() == 1 => Mode::Init,
        Some("--version") if args.len() == 1 => Mode::Version,
        Some("--help") if args.len() == 1 => Mode::Help,
        None => Mode::Help,
        _ => Mode::Unrecognized,
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match parse_args(args) {
        Mode::Run(opname, args) => run_operation(&opname, &args),
        Mode::Script(ext, file, args) => run_script(&ext, &file, &args),
        Mode::Cmd(ext, text, args) => run_command_text(&ext, &text, &args),
        Mode::Check(module) => check(module.as_deref()),
        Mode::Init => init_config(),
        Mode::Version => {
            println!("glas {}", env!("CARGO_PKG_VERSION"));
            0
        }
        Mode::Help => help(),
        Mode::Unrecognized => {
            eprintln!("unrecognized arguments");
            help()
        }
    };
    std::process::exit(code);
}
