//! Lox CLI and REPL
//!
//! Usage:
//!   lox              - Start interactive REPL
//!   lox <file.lox>   - Execute a Lox file
//!   lox help         - Show help message

use std::env;
use std::fs;
use std::process;

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use lox::{Error, VERSION, VM};

fn main() {
    let args: Vec<String> = env::args().collect();

    match args.len() {
        1 => run_repl(),
        2 => match args[1].as_str() {
            "repl" => run_repl(),
            "help" | "--help" | "-h" => print_help(),
            "version" | "--version" | "-v" => println!("lox {}", VERSION),
            path => run_file(path),
        },
        _ => {
            eprintln!("Usage: lox [path]");
            process::exit(2);
        }
    }
}

fn print_help() {
    println!("{}", "Lox".cyan().bold());
    println!("A bytecode interpreter for the Lox language");
    println!("{} {}\n", "Version".cyan(), VERSION);
    println!("{}", "USAGE:".yellow());
    println!("  lox                Start interactive REPL");
    println!("  lox <file.lox>     Execute a Lox file");
    println!("  lox help           Show this help message");
    println!("  lox version        Show version\n");
    println!("{}", "EXAMPLES:".yellow());
    println!("  var x = 1;                     Variable declaration");
    println!("  fun f(a) {{ return a * 2; }}    Function definition");
    println!("  class P {{ init(x) {{ this.x = x; }} }}");
    println!("  println(f(21));                Write a line to stdout");
}

fn run_file(path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("{}: cannot read file '{}': {}", "error".red(), path, e);
            process::exit(74);
        }
    };

    let mut vm = VM::new();
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(Error::Compile) => process::exit(65),
        Err(Error::Runtime) => process::exit(70),
    }
}

fn run_repl() {
    println!(
        "{} {} - {}",
        "Lox".cyan().bold(),
        VERSION.cyan(),
        "bytecode interpreter".dimmed()
    );
    println!("Type {} to exit\n", "exit".yellow());

    let mut rl = DefaultEditor::new().expect("Failed to create REPL");

    // One VM for the whole session, so globals and interned strings
    // persist across lines.
    let mut vm = VM::new();

    loop {
        match rl.readline(&format!("{} ", "lox>".green().bold())) {
            Ok(line) => {
                let line = line.trim();

                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                match line {
                    "exit" | "quit" => break,
                    "clear" => {
                        vm = VM::new();
                        println!("{}", "State cleared.".dimmed());
                        continue;
                    }
                    _ => {}
                }

                // Errors were already reported on stderr; keep reading.
                let _ = vm.interpret(line);
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".dimmed());
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{}: {:?}", "error".red(), err);
                break;
            }
        }
    }
}
