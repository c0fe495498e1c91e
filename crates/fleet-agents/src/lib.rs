pub mod evidence;
pub mod launcher;
pub mod prompts;
