use probelink_session::SessionCommand;

use crate::cmd::CommandArgs;
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_command, OutputFormat};

pub fn run(args: CommandArgs, format: OutputFormat) -> CliResult<i32> {
    let command: SessionCommand = args
        .word
        .parse()
        .map_err(|err| session_error("command rejected", err))?;
    print_command(&args.word, command, format);
    Ok(SUCCESS)
}
