use solder::{Config, Session};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // response files expand before parsing
    let args = match argfile::expand_args(argfile::parse_fromfile, argfile::PREFIX) {
        Ok(args) => args,
        Err(expand_error) => {
            eprintln!("solder: unable to expand response file: {expand_error}");
            std::process::exit(1);
        }
    };
    let args: Vec<String> = args
        .into_iter()
        .skip(1)
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    if args.is_empty() {
        eprintln!("usage: solder [options] file...");
        std::process::exit(1);
    }

    let session = Session::new();
    let mut config = Config::from_args(&session, &args);
    if !session.has_errors() {
        solder::run(&session, &mut config);
    }

    std::process::exit(session.exit_code());
}
