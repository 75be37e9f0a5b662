#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "model",
        action: "set_model",
    },
    CommandSpec {
        command: "voice",
        action: "set_voice",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "image",
    action: "attach_image",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "stories",
        action: "list_stories",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
];

pub(crate) const TWEAK_COMMAND: CommandSpec = CommandSpec {
    command: "tweak",
    action: "tweak",
};

pub(crate) const SELECT_COMMAND: CommandSpec = CommandSpec {
    command: "select",
    action: "select_story",
};

pub(crate) const DOWNLOAD_COMMAND: CommandSpec = CommandSpec {
    command: "download",
    action: "download",
};

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/image",
    "/tweak",
    "/stories",
    "/select",
    "/download",
    "/model",
    "/voice",
    "/help",
];
