use chaincni::commands;
use chaincni::plugin::RouterPlugin;

fn main() {
    commands::main::<RouterPlugin>();
}
