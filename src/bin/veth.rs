use chaincni::commands;
use chaincni::plugin::VethPlugin;

fn main() {
    commands::main::<VethPlugin>();
}
