//! Routes, the drawer menu, and the authentication gate in front of them.

use std::fmt;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Login,
    Dashboard,
    Profile,
    Doctors,
    Patients,
    Medicine,
    Nurses,
    Pharmacists,
    Laboratories,
    Labs,
    Beds,
}

impl Route {
    pub const ALL: [Route; 11] = [
        Route::Login,
        Route::Dashboard,
        Route::Profile,
        Route::Doctors,
        Route::Patients,
        Route::Medicine,
        Route::Nurses,
        Route::Pharmacists,
        Route::Laboratories,
        Route::Labs,
        Route::Beds,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            Self::Login => "/login",
            Self::Dashboard => "/dashboard",
            Self::Profile => "/profile",
            Self::Doctors => "/doctors",
            Self::Patients => "/patients",
            Self::Medicine => "/medicine",
            Self::Nurses => "/nurses",
            Self::Pharmacists => "/pharmacists",
            Self::Laboratories => "/laboratories",
            Self::Labs => "/labs",
            Self::Beds => "/beds",
        }
    }

    /// Accepts "/doctors", "doctors" or "Doctors"
    pub fn parse(s: &str) -> Option<Self> {
        let name = s.trim().trim_start_matches('/').to_lowercase();
        if name.is_empty() {
            return Some(Self::Dashboard);
        }
        Self::ALL
            .into_iter()
            .find(|route| route.path()[1..] == name)
    }

    pub fn is_protected(&self) -> bool {
        !matches!(self, Self::Login)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Where a navigation request actually lands given the session state.
pub fn resolve(requested: Route, authenticated: bool) -> Route {
    match (requested, authenticated) {
        (route, false) if route.is_protected() => Route::Login,
        (Route::Login, true) => Route::Dashboard,
        (route, _) => route,
    }
}

pub struct MenuItem {
    pub label: &'static str,
    pub route: Route,
}

pub struct MenuSection {
    pub label: &'static str,
    pub items: &'static [MenuItem],
}

pub const DRAWER: &[MenuSection] = &[
    MenuSection {
        label: "Account",
        items: &[MenuItem {
            label: "Profile",
            route: Route::Profile,
        }],
    },
    MenuSection {
        label: "Main",
        items: &[
            MenuItem {
                label: "Dashboard",
                route: Route::Dashboard,
            },
            MenuItem {
                label: "Doctor",
                route: Route::Doctors,
            },
            MenuItem {
                label: "Patients",
                route: Route::Patients,
            },
            MenuItem {
                label: "Medicine",
                route: Route::Medicine,
            },
        ],
    },
    MenuSection {
        label: "Users",
        items: &[
            MenuItem {
                label: "Nurses",
                route: Route::Nurses,
            },
            MenuItem {
                label: "Pharmacist",
                route: Route::Pharmacists,
            },
            MenuItem {
                label: "Laboratories",
                route: Route::Laboratories,
            },
        ],
    },
    MenuSection {
        label: "Labs",
        items: &[MenuItem {
            label: "Patients Test",
            route: Route::Labs,
        }],
    },
    MenuSection {
        label: "Beds",
        items: &[MenuItem {
            label: "Beds Categories",
            route: Route::Beds,
        }],
    },
];

/// Imperative navigation, used by the session guard to redirect on a
/// forced logout.
pub trait Navigator: Send + Sync {
    fn navigate(&self, route: Route);
    fn current(&self) -> Route;
}

/// Navigator for the interactive shell: tracks the current page and tells
/// the user when they get bounced to the login page.
pub struct ShellNavigator {
    current: Mutex<Route>,
}

impl ShellNavigator {
    pub fn new(initial: Route) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }
}

impl Navigator for ShellNavigator {
    fn navigate(&self, route: Route) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if *current == route {
            return;
        }
        info!(from = current.path(), to = route.path(), "navigate");
        if route == Route::Login && current.is_protected() {
            println!("Session ended. Redirected to {}", route);
        }
        *current = route;
    }

    fn current(&self) -> Route {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
